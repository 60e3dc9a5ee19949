//! Paged index tree.

use super::bulk::BuiltTree;
use super::file::PageFile;
use super::header::{IndexHeader, IndexState};
use super::node::{
    page_of, InternalNode, LeafNode, Node, NodeId, CHILD_SIZE, KEY_LEN_SIZE,
};
use super::seek::{SeekOrder, Seeker};
use crate::key::EntityId;
use crate::layout::Layout;
use nidx_common::{IndexError, Result, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Result of inserting a key.
#[derive(Debug, Clone)]
pub struct InsertOutcome<K> {
    /// False if the identical key was already present.
    pub inserted: bool,
    /// A stored key of another entity holding the same value, if any.
    pub value_equal_neighbor: Option<K>,
}

pub(crate) struct TreeInner<K> {
    nodes: Vec<Node<K>>,
    root: NodeId,
    height: u32,
    entry_count: u64,
}

impl<K> TreeInner<K> {
    fn empty() -> Self {
        Self {
            nodes: vec![Node::Leaf(LeafNode::new())],
            root: 0,
            height: 1,
            entry_count: 0,
        }
    }

    fn leaf(&self, id: NodeId) -> Option<&LeafNode<K>> {
        match self.nodes.get(id as usize) {
            Some(Node::Leaf(leaf)) => Some(leaf),
            _ => None,
        }
    }

    fn leaf_mut(&mut self, id: NodeId) -> Result<&mut LeafNode<K>> {
        match self.nodes.get_mut(id as usize) {
            Some(Node::Leaf(leaf)) => Ok(leaf),
            _ => Err(IndexError::Internal(format!("node {} is not a leaf", id))),
        }
    }

    fn internal_mut(&mut self, id: NodeId) -> Result<&mut InternalNode<K>> {
        match self.nodes.get_mut(id as usize) {
            Some(Node::Internal(node)) => Ok(node),
            _ => Err(IndexError::Internal(format!("node {} is not internal", id))),
        }
    }
}

/// B+ tree of index keys backed by one page file.
///
/// Nodes live in memory and are written out as pages on `checkpoint`.
/// Page 0 holds the header with the format version and lifecycle state.
/// Removals never rebalance; empty leaves stay linked and are skipped.
pub struct IndexTree<L: Layout> {
    layout: Arc<L>,
    file: PageFile,
    inner: RwLock<TreeInner<L::Key>>,
    header: Mutex<IndexHeader>,
}

impl<L: Layout> IndexTree<L> {
    /// Maximum tree height.
    const MAX_HEIGHT: u32 = 32;

    /// Creates an empty tree at `path`, discarding any existing file.
    pub fn create(layout: Arc<L>, path: &Path, fsync_enabled: bool) -> Result<Self> {
        let file = PageFile::create(path, fsync_enabled)?;
        let tree = Self {
            header: Mutex::new(IndexHeader::new(layout.version())),
            layout,
            file,
            inner: RwLock::new(TreeInner::empty()),
        };
        tree.checkpoint()?;
        debug!(path = %path.display(), "created index tree");
        Ok(tree)
    }

    /// Opens an existing tree, checking its format version and checksums.
    pub fn open(layout: Arc<L>, path: &Path, fsync_enabled: bool) -> Result<Self> {
        let file = PageFile::open(path, fsync_enabled)?;
        if file.num_pages() == 0 {
            return Err(IndexError::Corrupted(format!(
                "{} has no header page",
                path.display()
            )));
        }
        let header = IndexHeader::read_page(&file.read_page(0)?[..])?;
        layout.version().check_compatible(header.version)?;

        let mut nodes = Vec::with_capacity(header.node_count as usize);
        for id in 0..header.node_count {
            let page = file.read_page(page_of(id))?;
            nodes.push(Node::read_page(layout.as_ref(), &page[..])?);
        }
        if header.root >= header.node_count || header.height == 0 {
            return Err(IndexError::Corrupted(format!(
                "root {} outside {} nodes",
                header.root, header.node_count
            )));
        }
        let inner = TreeInner {
            nodes,
            root: header.root,
            height: header.height,
            entry_count: header.entry_count,
        };
        debug!(
            path = %path.display(),
            version = %header.version,
            state = %header.state,
            entries = header.entry_count,
            "opened index tree"
        );
        Ok(Self {
            layout,
            file,
            inner: RwLock::new(inner),
            header: Mutex::new(header),
        })
    }

    pub fn layout(&self) -> &Arc<L> {
        &self.layout
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.read().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    pub fn height(&self) -> u32 {
        self.inner.read().height
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Returns a copy of the header as last persisted or updated.
    pub fn header(&self) -> IndexHeader {
        self.header.lock().clone()
    }

    pub fn state(&self) -> IndexState {
        self.header.lock().state
    }

    /// Updates the lifecycle state and persists the whole tree.
    pub fn set_state(&self, state: IndexState, failure_message: Option<String>) -> Result<()> {
        {
            let mut header = self.header.lock();
            header.state = state;
            header.failure_message = failure_message;
        }
        self.checkpoint()
    }

    /// Writes every node and the header, then trims stale pages.
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.inner.read();
        let mut page = Box::new([0u8; PAGE_SIZE]);
        for (id, node) in inner.nodes.iter().enumerate() {
            node.write_page(self.layout.as_ref(), id as NodeId, &mut page)?;
            self.file.write_page(page_of(id as NodeId), &page)?;
        }

        let mut header = self.header.lock();
        header.root = inner.root;
        header.height = inner.height;
        header.node_count = inner.nodes.len() as u32;
        header.entry_count = inner.entry_count;
        header.write_page(&mut page);
        self.file.write_page(0, &page)?;
        self.file.truncate(header.node_count + 1)?;
        self.file.flush()?;

        debug!(
            path = %self.file.path().display(),
            state = %header.state,
            nodes = header.node_count,
            entries = header.entry_count,
            "checkpointed index tree"
        );
        Ok(())
    }

    /// Replaces the empty tree with a bulk-loaded one.
    pub fn install(&self, built: BuiltTree<L::Key>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.entry_count != 0 {
            return Err(IndexError::invalid_state(
                "bulk load into a non-empty index tree",
            ));
        }
        if built.height > Self::MAX_HEIGHT {
            return Err(IndexError::Internal(format!(
                "bulk load built a tree of height {}",
                built.height
            )));
        }
        debug!(
            entries = built.entry_count,
            nodes = built.nodes.len(),
            height = built.height,
            "installed bulk-loaded tree"
        );
        *inner = TreeInner {
            nodes: built.nodes,
            root: built.root,
            height: built.height,
            entry_count: built.entry_count,
        };
        Ok(())
    }

    /// Descends to the leaf that covers `key`.
    fn find_leaf(&self, inner: &TreeInner<L::Key>, key: &L::Key) -> NodeId {
        let mut current = inner.root;
        while let Some(Node::Internal(node)) = inner.nodes.get(current as usize) {
            current = node.children[node.child_index(self.layout.as_ref(), key)];
        }
        current
    }

    /// Descends to the leaf for `key`, recording `(node, child index)` on the way.
    fn find_leaf_with_path(
        &self,
        inner: &TreeInner<L::Key>,
        key: &L::Key,
        path: &mut Vec<(NodeId, usize)>,
    ) -> NodeId {
        let mut current = inner.root;
        while let Some(Node::Internal(node)) = inner.nodes.get(current as usize) {
            let idx = node.child_index(self.layout.as_ref(), key);
            path.push((current, idx));
            current = node.children[idx];
        }
        current
    }

    /// Last key before position `pos` of `leaf_id`, looking into earlier leaves.
    fn key_before<'a>(
        &self,
        inner: &'a TreeInner<L::Key>,
        leaf_id: NodeId,
        pos: usize,
    ) -> Option<&'a L::Key> {
        let leaf = inner.leaf(leaf_id)?;
        if pos > 0 {
            return leaf.keys.get(pos - 1);
        }
        let mut prev = leaf.prev;
        while let Some(id) = prev {
            let leaf = inner.leaf(id)?;
            if let Some(key) = leaf.keys.last() {
                return Some(key);
            }
            prev = leaf.prev;
        }
        None
    }

    /// Key at position `pos` of `leaf_id`, or the first key of a later leaf.
    fn key_at_or_after<'a>(
        &self,
        inner: &'a TreeInner<L::Key>,
        leaf_id: NodeId,
        pos: usize,
    ) -> Option<&'a L::Key> {
        let leaf = inner.leaf(leaf_id)?;
        if let Some(key) = leaf.keys.get(pos) {
            return Some(key);
        }
        let mut next = leaf.next;
        while let Some(id) = next {
            let leaf = inner.leaf(id)?;
            if let Some(key) = leaf.keys.first() {
                return Some(key);
            }
            next = leaf.next;
        }
        None
    }

    fn is_value_equal_other(&self, stored: &L::Key, key: &L::Key) -> bool {
        self.layout.compare_value(stored, key) == Ordering::Equal
            && self.layout.entity_id(stored) != self.layout.entity_id(key)
    }

    /// Inserts `key`, reporting a neighbouring key of another entity with
    /// the same value.
    pub fn insert(&self, key: &L::Key) -> Result<InsertOutcome<L::Key>> {
        let layout = Arc::clone(&self.layout);
        let mut inner = self.inner.write();
        let mut path = Vec::with_capacity(inner.height as usize);
        let leaf_id = self.find_leaf_with_path(&inner, key, &mut path);

        let pos = {
            let leaf = inner.leaf_mut(leaf_id)?;
            match leaf.keys.binary_search_by(|k| layout.compare(k, key)) {
                Ok(_) => {
                    return Ok(InsertOutcome {
                        inserted: false,
                        value_equal_neighbor: None,
                    })
                }
                Err(pos) => pos,
            }
        };

        let neighbor = self
            .key_before(&inner, leaf_id, pos)
            .filter(|k| self.is_value_equal_other(k, key))
            .or_else(|| {
                self.key_at_or_after(&inner, leaf_id, pos)
                    .filter(|k| self.is_value_equal_other(k, key))
            })
            .cloned();

        let overfull = {
            let leaf = inner.leaf_mut(leaf_id)?;
            leaf.keys.insert(pos, key.clone());
            leaf.bytes += KEY_LEN_SIZE + layout.key_size(key);
            leaf.bytes > super::node::NODE_CAPACITY
        };
        inner.entry_count += 1;
        if overfull {
            self.split_leaf(&mut inner, path, leaf_id)?;
        }
        Ok(InsertOutcome {
            inserted: true,
            value_equal_neighbor: neighbor,
        })
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn remove(&self, key: &L::Key) -> Result<bool> {
        let layout = Arc::clone(&self.layout);
        let mut inner = self.inner.write();
        let leaf_id = self.find_leaf(&inner, key);
        let leaf = inner.leaf_mut(leaf_id)?;
        match leaf.keys.binary_search_by(|k| layout.compare(k, key)) {
            Ok(pos) => {
                let removed = leaf.keys.remove(pos);
                leaf.bytes -= KEY_LEN_SIZE + layout.key_size(&removed);
                inner.entry_count -= 1;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Index at which the first half of `sizes` reaches half of the total.
    fn split_point(sizes: impl Iterator<Item = usize>, total: usize, len: usize) -> usize {
        let mut acc = 0;
        let mut mid = len;
        for (i, size) in sizes.enumerate() {
            acc += size;
            if acc * 2 >= total {
                mid = i + 1;
                break;
            }
        }
        mid.clamp(1, len.saturating_sub(1).max(1))
    }

    fn split_leaf(
        &self,
        inner: &mut TreeInner<L::Key>,
        path: Vec<(NodeId, usize)>,
        leaf_id: NodeId,
    ) -> Result<()> {
        let layout = self.layout.as_ref();
        let right_id = inner.nodes.len() as NodeId;
        let (right, separator, old_next) = {
            let leaf = inner.leaf_mut(leaf_id)?;
            let sizes = leaf.keys.iter().map(|k| KEY_LEN_SIZE + layout.key_size(k));
            let mid = Self::split_point(sizes, leaf.bytes, leaf.keys.len());
            let right_keys = leaf.keys.split_off(mid);
            let right_bytes: usize = right_keys
                .iter()
                .map(|k| KEY_LEN_SIZE + layout.key_size(k))
                .sum();
            leaf.bytes -= right_bytes;

            let mut separator = layout.new_key();
            match (leaf.keys.last(), right_keys.first()) {
                (Some(left), Some(right)) => layout.minimal_splitter(left, right, &mut separator),
                _ => return Err(IndexError::Internal("split of a single-entry leaf".to_string())),
            }
            let old_next = leaf.next;
            leaf.next = Some(right_id);
            let right = LeafNode {
                keys: right_keys,
                prev: Some(leaf_id),
                next: old_next,
                bytes: right_bytes,
            };
            (right, separator, old_next)
        };
        if let Some(next) = old_next {
            inner.leaf_mut(next)?.prev = Some(right_id);
        }
        inner.nodes.push(Node::Leaf(right));
        self.insert_into_parent(inner, path, leaf_id, separator, right_id, 0)
    }

    /// Links a new right sibling into the parent, splitting upwards as needed.
    fn insert_into_parent(
        &self,
        inner: &mut TreeInner<L::Key>,
        mut path: Vec<(NodeId, usize)>,
        mut left_id: NodeId,
        mut separator: L::Key,
        mut right_id: NodeId,
        mut child_level: u8,
    ) -> Result<()> {
        let layout = self.layout.as_ref();
        loop {
            let framed = KEY_LEN_SIZE + layout.key_size(&separator) + CHILD_SIZE;
            let Some((parent_id, idx)) = path.pop() else {
                let mut root = InternalNode::new(child_level + 1, left_id);
                root.keys.push(separator);
                root.children.push(right_id);
                root.bytes += framed;
                let root_id = inner.nodes.len() as NodeId;
                inner.nodes.push(Node::Internal(root));
                inner.root = root_id;
                inner.height += 1;
                if inner.height > Self::MAX_HEIGHT {
                    return Err(IndexError::Internal(format!(
                        "index tree height exceeds {}",
                        Self::MAX_HEIGHT
                    )));
                }
                return Ok(());
            };

            let new_id = inner.nodes.len() as NodeId;
            let split = {
                let parent = inner.internal_mut(parent_id)?;
                parent.keys.insert(idx, separator);
                parent.children.insert(idx + 1, right_id);
                parent.bytes += framed;
                if parent.bytes <= super::node::NODE_CAPACITY {
                    return Ok(());
                }

                let sizes = parent
                    .keys
                    .iter()
                    .map(|k| KEY_LEN_SIZE + layout.key_size(k) + CHILD_SIZE);
                let len = parent.keys.len();
                let mid = Self::split_point(sizes, parent.bytes, len).min(len - 1);
                let mut right_keys = parent.keys.split_off(mid);
                let right_children = parent.children.split_off(mid + 1);
                let promoted = right_keys.remove(0);

                let mut right = InternalNode::new(parent.level, right_children[0]);
                right.children = right_children;
                right.bytes += right_keys
                    .iter()
                    .map(|k| KEY_LEN_SIZE + layout.key_size(k) + CHILD_SIZE)
                    .sum::<usize>();
                right.keys = right_keys;
                parent.bytes = CHILD_SIZE
                    + parent
                        .keys
                        .iter()
                        .map(|k| KEY_LEN_SIZE + layout.key_size(k) + CHILD_SIZE)
                        .sum::<usize>();
                (right, promoted, parent.level)
            };
            let (right, promoted, level) = split;
            inner.nodes.push(Node::Internal(right));
            left_id = parent_id;
            separator = promoted;
            right_id = new_id;
            child_level = level;
        }
    }

    /// Copies up to `limit` keys from `lo` (inclusive or not) toward `to`
    /// (exclusive) into `out`. Returns true once the range is exhausted.
    pub(crate) fn collect_ascending(
        &self,
        lo: &L::Key,
        inclusive: bool,
        to: &L::Key,
        limit: usize,
        out: &mut VecDeque<L::Key>,
    ) -> bool {
        let layout = self.layout.as_ref();
        let inner = self.inner.read();
        let mut leaf_id = self.find_leaf(&inner, lo);
        let Some(leaf) = inner.leaf(leaf_id) else {
            return true;
        };
        let mut pos = leaf.keys.partition_point(|k| match layout.compare(k, lo) {
            Ordering::Less => true,
            Ordering::Equal => !inclusive,
            Ordering::Greater => false,
        });
        loop {
            let Some(leaf) = inner.leaf(leaf_id) else {
                return true;
            };
            while let Some(key) = leaf.keys.get(pos) {
                if layout.compare(key, to) != Ordering::Less {
                    return true;
                }
                if out.len() >= limit {
                    return false;
                }
                out.push_back(key.clone());
                pos += 1;
            }
            match leaf.next {
                Some(next) => {
                    leaf_id = next;
                    pos = 0;
                }
                None => return true,
            }
        }
    }

    /// Copies up to `limit` keys below `hi` (exclusive) down to `from`
    /// (inclusive) into `out`, in descending order.
    pub(crate) fn collect_descending(
        &self,
        hi: &L::Key,
        from: &L::Key,
        limit: usize,
        out: &mut VecDeque<L::Key>,
    ) -> bool {
        let layout = self.layout.as_ref();
        let inner = self.inner.read();
        let mut leaf_id = self.find_leaf(&inner, hi);
        let Some(leaf) = inner.leaf(leaf_id) else {
            return true;
        };
        let mut pos = leaf
            .keys
            .partition_point(|k| layout.compare(k, hi) == Ordering::Less);
        loop {
            let Some(leaf) = inner.leaf(leaf_id) else {
                return true;
            };
            while pos > 0 {
                let key = &leaf.keys[pos - 1];
                if layout.compare(key, from) == Ordering::Less {
                    return true;
                }
                if out.len() >= limit {
                    return false;
                }
                out.push_back(key.clone());
                pos -= 1;
            }
            match leaf.prev.and_then(|prev| inner.leaf(prev).map(|l| (prev, l.keys.len()))) {
                Some((prev, len)) => {
                    leaf_id = prev;
                    pos = len;
                }
                None => return true,
            }
        }
    }

    /// Opens a cursor over `[from, to)`.
    pub fn seek(&self, from: &L::Key, to: &L::Key, order: SeekOrder) -> Seeker<'_, L> {
        Seeker::new(self, from, to, order)
    }

    /// Opens a cursor over every key.
    pub fn scan(&self, order: SeekOrder) -> Seeker<'_, L> {
        let mut from = self.layout.new_key();
        let mut to = self.layout.new_key();
        self.layout.init_lowest(&mut from);
        self.layout.init_highest(&mut to);
        Seeker::new(self, &from, &to, order)
    }

    /// Every stored key with the same value as `key`, in entity order.
    pub fn value_entries(&self, key: &L::Key) -> Vec<L::Key> {
        let mut from = key.clone();
        self.layout.set_entity_id(&mut from, EntityId::MIN);
        let mut to = self.layout.new_key();
        self.layout.init_highest(&mut to);
        self.seek(&from, &to, SeekOrder::Ascending)
            .take_while(|k| self.layout.compare_value(k, key) == Ordering::Equal)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::IndexKey;
    use crate::layout::GenericLayout;
    use crate::tree::bulk::BulkLoader;
    use crate::tree::header::IndexState;
    use nidx_common::{FormatVersion, Value};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn create_test_tree(dir: &Path) -> IndexTree<GenericLayout> {
        IndexTree::create(Arc::new(GenericLayout::new(1)), &dir.join("test.idx"), false).unwrap()
    }

    fn text_key(entity: i64, text: &str) -> IndexKey {
        GenericLayout::new(1).key_of(entity, &[Value::text(text)]).unwrap()
    }

    fn entities(keys: impl Iterator<Item = IndexKey>) -> Vec<i64> {
        keys.map(|k| k.entity_id()).collect()
    }

    #[test]
    fn test_insert_and_scan_in_order() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        let mut ids: Vec<i64> = (0..5000).collect();
        ids.shuffle(&mut rand::rngs::StdRng::seed_from_u64(3));
        for id in &ids {
            let outcome = tree
                .insert(&text_key(*id, &format!("key-{:05}", id)))
                .unwrap();
            assert!(outcome.inserted);
            assert!(outcome.value_equal_neighbor.is_none());
        }
        assert_eq!(tree.entry_count(), 5000);
        assert!(tree.height() > 1);
        assert_eq!(
            entities(tree.scan(SeekOrder::Ascending)),
            (0..5000).collect::<Vec<_>>()
        );
        assert_eq!(
            entities(tree.scan(SeekOrder::Descending)),
            (0..5000).rev().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_insert_reports_value_equal_neighbor() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        tree.insert(&text_key(1, "a")).unwrap();
        tree.insert(&text_key(3, "c")).unwrap();

        let outcome = tree.insert(&text_key(2, "a")).unwrap();
        assert!(outcome.inserted);
        assert_eq!(outcome.value_equal_neighbor.map(|k| k.entity_id()), Some(1));

        let again = tree.insert(&text_key(2, "a")).unwrap();
        assert!(!again.inserted);
        assert_eq!(tree.entry_count(), 3);
        assert_eq!(entities(tree.value_entries(&text_key(0, "a")).into_iter()), vec![1, 2]);
    }

    #[test]
    fn test_negative_entity_ids_stay_reachable() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        let keys: Vec<IndexKey> = (0..3000)
            .map(|i| text_key(-10 - i, &format!("neg-{:05}", i)))
            .collect();
        for key in &keys {
            tree.insert(key).unwrap();
        }
        assert!(tree.height() > 1);
        for key in &keys {
            assert!(tree.remove(key).unwrap(), "lost {}", key.entity_id());
        }
        assert_eq!(tree.entry_count(), 0);
        assert!(tree.scan(SeekOrder::Ascending).next().is_none());
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        tree.insert(&text_key(1, "a")).unwrap();
        tree.insert(&text_key(2, "b")).unwrap();
        assert!(tree.remove(&text_key(1, "a")).unwrap());
        assert!(!tree.remove(&text_key(1, "a")).unwrap());
        assert_eq!(tree.entry_count(), 1);
        assert_eq!(entities(tree.scan(SeekOrder::Ascending)), vec![2]);
    }

    #[test]
    fn test_range_bounds() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        for (i, text) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            tree.insert(&text_key(i as i64, text)).unwrap();
        }
        let layout = GenericLayout::new(1);
        let mut from = layout.key_of(0, &[Value::text("b")]).unwrap();
        from.set_entity_id(EntityId::MIN);
        let mut to = layout.key_of(0, &[Value::text("d")]).unwrap();
        to.set_entity_id(EntityId::MIN);

        assert_eq!(entities(tree.seek(&from, &to, SeekOrder::Ascending)), vec![1, 2]);
        assert_eq!(entities(tree.seek(&from, &to, SeekOrder::Descending)), vec![2, 1]);
        assert!(tree.seek(&to, &from, SeekOrder::Ascending).next().is_none());
    }

    #[test]
    fn test_nested_seekers() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        for i in 0..300 {
            tree.insert(&text_key(i, &format!("{:04}", i))).unwrap();
        }
        let mut pairs = 0;
        for outer in tree.scan(SeekOrder::Ascending).take(10) {
            let inner_count = tree.scan(SeekOrder::Descending).count();
            assert_eq!(inner_count, 300);
            assert!(outer.entity_id() < 10);
            pairs += 1;
        }
        assert_eq!(pairs, 10);
    }

    #[test]
    fn test_seeker_sees_inserts_between_batches() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        for i in 0..200 {
            tree.insert(&text_key(i * 2, &format!("{:05}", i * 2))).unwrap();
        }
        let mut seeker = tree.scan(SeekOrder::Ascending);
        let first = seeker.next().unwrap();
        assert_eq!(first.entity_id(), 0);
        tree.insert(&text_key(399, "00399")).unwrap();
        let rest = entities(seeker);
        assert_eq!(rest.len(), 200);
        assert_eq!(*rest.last().unwrap(), 399);
    }

    #[test]
    fn test_checkpoint_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.idx");
        let layout = Arc::new(GenericLayout::new(1));
        {
            let tree = IndexTree::create(Arc::clone(&layout), &path, false).unwrap();
            for i in 0..3000 {
                tree.insert(&text_key(i, &format!("k{:05}", i))).unwrap();
            }
            tree.set_state(IndexState::Online, None).unwrap();
        }
        let tree = IndexTree::open(Arc::clone(&layout), &path, false).unwrap();
        assert_eq!(tree.state(), IndexState::Online);
        assert_eq!(tree.entry_count(), 3000);
        assert_eq!(
            entities(tree.scan(SeekOrder::Ascending)),
            (0..3000).collect::<Vec<_>>()
        );
        assert_eq!(
            entities(tree.scan(SeekOrder::Descending)).first(),
            Some(&2999)
        );
    }

    #[test]
    fn test_failed_state_message_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failed.idx");
        let layout = Arc::new(GenericLayout::new(1));
        {
            let tree = IndexTree::create(Arc::clone(&layout), &path, false).unwrap();
            tree.set_state(IndexState::Failed, Some("boom".to_string()))
                .unwrap();
        }
        let header = IndexTree::open(layout, &path, false).unwrap().header();
        assert_eq!(header.state, IndexState::Failed);
        assert_eq!(header.failure_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.idx");
        let file = PageFile::create(&path, false).unwrap();
        let mut header = IndexHeader::new(FormatVersion::new(2, 0));
        header.node_count = 0;
        let mut page = [0u8; PAGE_SIZE];
        header.write_page(&mut page);
        file.write_page(0, &page).unwrap();
        file.flush().unwrap();
        drop(file);

        let result = IndexTree::open(Arc::new(GenericLayout::new(1)), &path, false);
        assert!(matches!(
            result,
            Err(IndexError::IncompatibleVersion {
                found_major: 2,
                expected_major: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_bulk_install_then_insert() {
        let dir = tempdir().unwrap();
        let tree = create_test_tree(dir.path());
        let layout = Arc::clone(tree.layout());
        let mut loader = BulkLoader::new(Arc::clone(&layout));
        for i in 0..10_000 {
            loader
                .push(&text_key(i * 2, &format!("v{:06}", i * 2)))
                .unwrap();
        }
        tree.install(loader.finish()).unwrap();
        assert_eq!(tree.entry_count(), 10_000);

        for i in 0..1000 {
            let id = i * 20 + 1;
            tree.insert(&text_key(id, &format!("v{:06}", id))).unwrap();
        }
        let scanned = entities(tree.scan(SeekOrder::Ascending));
        assert_eq!(scanned.len(), 11_000);
        assert!(scanned.windows(2).all(|w| w[0] < w[1]));

        let again = BulkLoader::new(layout).finish();
        assert!(matches!(tree.install(again), Err(IndexError::InvalidState(_))));
    }
}
