//! Tree nodes and their page encoding.
//!
//! Leaf page payload:
//! ```text
//! +----------------------+
//! | len: u16 | key bytes |  x entry_count
//! +----------------------+
//! ```
//!
//! Internal page payload:
//! ```text
//! +---------------------------------------+
//! | child_0: u32                          |
//! | len: u16 | separator bytes | child: u32 |  x entry_count
//! +---------------------------------------+
//! ```
//!
//! Child and sibling pointers hold page numbers. Node `n` lives on page
//! `n + 1`; page 0 is the index header.

use crate::layout::Layout;
use bytes::{Buf, BufMut};
use nidx_common::{IndexError, PageHeader, PageNum, PageType, Result, NO_PAGE, PAGE_SIZE};

/// Index of a node in the tree's node table.
pub(crate) type NodeId = u32;

/// Payload bytes available in one page.
pub(crate) const NODE_CAPACITY: usize = PAGE_SIZE - PageHeader::SIZE;

/// Length prefix of every key in a node.
pub(crate) const KEY_LEN_SIZE: usize = 2;

/// Size of a child pointer.
pub(crate) const CHILD_SIZE: usize = 4;

pub(crate) fn page_of(id: NodeId) -> PageNum {
    id + 1
}

fn link_of(id: Option<NodeId>) -> PageNum {
    id.map_or(NO_PAGE, page_of)
}

fn node_of(page: PageNum) -> Result<NodeId> {
    page.checked_sub(1)
        .ok_or_else(|| IndexError::Corrupted("node pointer to header page".to_string()))
}

fn node_link(page: PageNum) -> Result<Option<NodeId>> {
    if page == NO_PAGE {
        Ok(None)
    } else {
        node_of(page).map(Some)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LeafNode<K> {
    pub keys: Vec<K>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    /// Encoded payload size.
    pub bytes: usize,
}

impl<K> LeafNode<K> {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            prev: None,
            next: None,
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InternalNode<K> {
    /// `keys[i]` separates `children[i]` from `children[i + 1]`; every key
    /// under `children[i + 1]` is at least `keys[i]`.
    pub keys: Vec<K>,
    pub children: Vec<NodeId>,
    /// Height above the leaves, 1 for parents of leaves.
    pub level: u8,
    pub bytes: usize,
}

impl<K> InternalNode<K> {
    pub fn new(level: u8, first_child: NodeId) -> Self {
        Self {
            keys: Vec::new(),
            children: vec![first_child],
            level,
            bytes: CHILD_SIZE,
        }
    }

    /// Finds the child covering `key`.
    pub fn child_index<L: Layout<Key = K>>(&self, layout: &L, key: &K) -> usize {
        self.keys
            .partition_point(|sep| layout.compare(sep, key) != std::cmp::Ordering::Greater)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node<K> {
    Leaf(LeafNode<K>),
    Internal(InternalNode<K>),
}

impl<K> Node<K> {
    /// Encodes this node into a full page and seals its checksum.
    pub fn write_page<L: Layout<Key = K>>(
        &self,
        layout: &L,
        id: NodeId,
        page: &mut [u8; PAGE_SIZE],
    ) -> Result<()> {
        page.fill(0);
        let header = {
            let mut out: &mut [u8] = &mut page[PageHeader::SIZE..];
            match self {
                Node::Leaf(leaf) => {
                    for key in &leaf.keys {
                        put_key(layout, key, &mut out)?;
                    }
                    let mut header = PageHeader::new(page_of(id), PageType::Leaf, 0);
                    header.entry_count = entry_count(leaf.keys.len())?;
                    header.prev = link_of(leaf.prev);
                    header.next = link_of(leaf.next);
                    header
                }
                Node::Internal(node) => {
                    out.put_u32_le(page_of(node.children[0]));
                    for (key, child) in node.keys.iter().zip(&node.children[1..]) {
                        put_key(layout, key, &mut out)?;
                        if out.remaining_mut() < CHILD_SIZE {
                            return Err(overflow(id));
                        }
                        out.put_u32_le(page_of(*child));
                    }
                    let mut header =
                        PageHeader::new(page_of(id), PageType::Internal, node.level);
                    header.entry_count = entry_count(node.keys.len())?;
                    header
                }
            }
        };
        page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        PageHeader::seal(page);
        Ok(())
    }

    /// Decodes a node from a page, verifying its checksum.
    pub fn read_page<L: Layout<Key = K>>(layout: &L, page: &[u8]) -> Result<Self> {
        let header = PageHeader::verify(page)?;
        let mut input: &[u8] = &page[PageHeader::SIZE..];
        let count = header.entry_count as usize;
        match header.page_type {
            PageType::Leaf => {
                let mut leaf = LeafNode::new();
                leaf.prev = node_link(header.prev)?;
                leaf.next = node_link(header.next)?;
                for _ in 0..count {
                    let key = get_key(layout, &mut input)?;
                    leaf.bytes += KEY_LEN_SIZE + layout.key_size(&key);
                    leaf.keys.push(key);
                }
                Ok(Node::Leaf(leaf))
            }
            PageType::Internal => {
                if input.len() < CHILD_SIZE {
                    return Err(IndexError::Corrupted("internal page truncated".to_string()));
                }
                let mut node = InternalNode::new(header.level, node_of(input.get_u32_le())?);
                for _ in 0..count {
                    let key = get_key(layout, &mut input)?;
                    if input.len() < CHILD_SIZE {
                        return Err(IndexError::Corrupted("internal page truncated".to_string()));
                    }
                    let child = node_of(input.get_u32_le())?;
                    node.bytes += KEY_LEN_SIZE + layout.key_size(&key) + CHILD_SIZE;
                    node.keys.push(key);
                    node.children.push(child);
                }
                Ok(Node::Internal(node))
            }
            other => Err(IndexError::Corrupted(format!(
                "page {} has type {:?}, expected a tree node",
                header.page_num, other
            ))),
        }
    }
}

fn entry_count(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| IndexError::Internal(format!("node holds {} entries", len)))
}

fn overflow(id: NodeId) -> IndexError {
    IndexError::Internal(format!("node {} does not fit in a page", id))
}

fn put_key<L: Layout>(layout: &L, key: &L::Key, out: &mut &mut [u8]) -> Result<()> {
    let size = layout.key_size(key);
    if out.remaining_mut() < KEY_LEN_SIZE + size {
        return Err(IndexError::Internal(format!(
            "key of {} bytes does not fit in node page",
            size
        )));
    }
    out.put_u16_le(size as u16);
    layout.write_key(key, out);
    Ok(())
}

fn get_key<L: Layout>(layout: &L, input: &mut &[u8]) -> Result<L::Key> {
    if input.len() < KEY_LEN_SIZE {
        return Err(IndexError::Corrupted("node page truncated".to_string()));
    }
    let len = input.get_u16_le() as usize;
    if input.len() < len {
        return Err(IndexError::Corrupted("node key truncated".to_string()));
    }
    let mut key_bytes: &[u8] = &input[..len];
    let mut key = layout.new_key();
    layout.read_key(&mut key_bytes, &mut key)?;
    input.advance(len);
    Ok(key)
}
