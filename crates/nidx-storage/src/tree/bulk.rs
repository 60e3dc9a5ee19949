//! Bottom-up construction of a tree from sorted keys.

use super::node::{InternalNode, LeafNode, Node, NodeId, CHILD_SIZE, KEY_LEN_SIZE, NODE_CAPACITY};
use crate::layout::Layout;
use nidx_common::{IndexError, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// Fraction of a page filled by bulk loading, leaving room for later inserts.
pub const BULK_FILL_FACTOR: f64 = 0.9;

/// Node table produced by a bulk load, ready to install into a tree.
pub struct BuiltTree<K> {
    pub(crate) nodes: Vec<Node<K>>,
    pub(crate) root: NodeId,
    pub(crate) height: u32,
    pub(crate) entry_count: u64,
}

impl<K> BuiltTree<K> {
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Builds leaves from a strictly ascending key stream, then stacks
/// internal levels separated by minimal splitters.
pub struct BulkLoader<L: Layout> {
    layout: Arc<L>,
    fill_limit: usize,
    nodes: Vec<Node<L::Key>>,
    current: LeafNode<L::Key>,
    /// Separator in front of each finished leaf, `None` for the first.
    leaves: Vec<(Option<L::Key>, NodeId)>,
    /// Separator in front of the leaf being filled.
    pending_separator: Option<L::Key>,
    last: Option<L::Key>,
    entry_count: u64,
}

impl<L: Layout> BulkLoader<L> {
    pub fn new(layout: Arc<L>) -> Self {
        Self::with_fill_factor(layout, BULK_FILL_FACTOR)
    }

    pub fn with_fill_factor(layout: Arc<L>, fill_factor: f64) -> Self {
        let fill_limit = ((NODE_CAPACITY as f64) * fill_factor.clamp(0.1, 1.0)) as usize;
        Self {
            layout,
            fill_limit,
            nodes: Vec::new(),
            current: LeafNode::new(),
            leaves: Vec::new(),
            pending_separator: None,
            last: None,
            entry_count: 0,
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Appends the next key. Keys must arrive in strictly ascending order.
    pub fn push(&mut self, key: &L::Key) -> Result<()> {
        if let Some(last) = &self.last {
            if self.layout.compare(last, key) != Ordering::Less {
                return Err(IndexError::InvalidArgument(format!(
                    "bulk load input out of order at {}",
                    self.layout.describe_value(key)
                )));
            }
        }
        let framed = KEY_LEN_SIZE + self.layout.key_size(key);
        if !self.current.keys.is_empty() && self.current.bytes + framed > self.fill_limit {
            let mut separator = self.layout.new_key();
            if let Some(last) = self.current.keys.last() {
                self.layout.minimal_splitter(last, key, &mut separator);
            }
            self.finish_leaf();
            self.pending_separator = Some(separator);
        }
        self.current.keys.push(key.clone());
        self.current.bytes += framed;
        match &mut self.last {
            Some(last) => last.clone_from(key),
            None => self.last = Some(key.clone()),
        }
        self.entry_count += 1;
        Ok(())
    }

    fn finish_leaf(&mut self) {
        let id = self.nodes.len() as NodeId;
        let mut leaf = std::mem::replace(&mut self.current, LeafNode::new());
        if let Some((_, prev_id)) = self.leaves.last() {
            let prev_id = *prev_id;
            leaf.prev = Some(prev_id);
            if let Some(Node::Leaf(prev)) = self.nodes.get_mut(prev_id as usize) {
                prev.next = Some(id);
            }
        }
        self.nodes.push(Node::Leaf(leaf));
        self.leaves.push((self.pending_separator.take(), id));
    }

    /// Finishes the last leaf and builds the internal levels.
    pub fn finish(mut self) -> BuiltTree<L::Key> {
        self.finish_leaf();
        let mut level = std::mem::take(&mut self.leaves);
        let mut height = 1u32;

        while level.len() > 1 {
            let mut parents: Vec<(Option<L::Key>, NodeId)> = Vec::new();
            let mut entries = std::mem::take(&mut level).into_iter();
            let Some((first_sep, first_child)) = entries.next() else {
                break;
            };
            let mut node_sep = first_sep;
            let mut node = InternalNode::new(height as u8, first_child);

            for (sep, child) in entries {
                let Some(sep) = sep else { continue };
                let framed = KEY_LEN_SIZE + self.layout.key_size(&sep) + CHILD_SIZE;
                if !node.keys.is_empty() && node.bytes + framed > self.fill_limit {
                    let id = self.nodes.len() as NodeId;
                    let full = std::mem::replace(&mut node, InternalNode::new(height as u8, child));
                    self.nodes.push(Node::Internal(full));
                    parents.push((node_sep.take(), id));
                    node_sep = Some(sep);
                } else {
                    node.keys.push(sep);
                    node.children.push(child);
                    node.bytes += framed;
                }
            }
            let id = self.nodes.len() as NodeId;
            self.nodes.push(Node::Internal(node));
            parents.push((node_sep, id));

            level = parents;
            height += 1;
        }

        let root = level.first().map_or(0, |(_, id)| *id);
        BuiltTree {
            nodes: self.nodes,
            root,
            height,
            entry_count: self.entry_count,
        }
    }
}
