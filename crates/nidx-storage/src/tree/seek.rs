//! Range cursors over the tree.

use super::index::IndexTree;
use crate::layout::Layout;
use std::collections::VecDeque;

/// Entries copied out of the tree per lock acquisition.
pub const SEEK_BATCH_SIZE: usize = 64;

/// Direction of a range seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrder {
    Ascending,
    Descending,
}

/// Cursor over the keys in `[from, to)`.
///
/// Keys are copied out in batches under a short read lock. Each batch
/// re-descends from the last key returned, so a seeker holds no lock
/// between batches and any number of seekers may be open at once.
pub struct Seeker<'t, L: Layout> {
    tree: &'t IndexTree<L>,
    from: L::Key,
    to: L::Key,
    order: SeekOrder,
    batch: VecDeque<L::Key>,
    last: Option<L::Key>,
    exhausted: bool,
}

impl<'t, L: Layout> Seeker<'t, L> {
    pub(crate) fn new(tree: &'t IndexTree<L>, from: &L::Key, to: &L::Key, order: SeekOrder) -> Self {
        Self {
            tree,
            from: from.clone(),
            to: to.clone(),
            order,
            batch: VecDeque::with_capacity(SEEK_BATCH_SIZE),
            last: None,
            exhausted: false,
        }
    }

    pub fn order(&self) -> SeekOrder {
        self.order
    }

    fn fill(&mut self) {
        let done = match self.order {
            SeekOrder::Ascending => {
                let (lo, inclusive) = match &self.last {
                    Some(last) => (last, false),
                    None => (&self.from, true),
                };
                self.tree
                    .collect_ascending(lo, inclusive, &self.to, SEEK_BATCH_SIZE, &mut self.batch)
            }
            SeekOrder::Descending => {
                let hi = self.last.as_ref().unwrap_or(&self.to);
                self.tree
                    .collect_descending(hi, &self.from, SEEK_BATCH_SIZE, &mut self.batch)
            }
        };
        if let Some(back) = self.batch.back() {
            match &mut self.last {
                Some(last) => last.clone_from(back),
                None => self.last = Some(back.clone()),
            }
        }
        self.exhausted = done || self.batch.is_empty();
    }
}

impl<L: Layout> Iterator for Seeker<'_, L> {
    type Item = L::Key;

    fn next(&mut self) -> Option<L::Key> {
        if self.batch.is_empty() {
            if self.exhausted {
                return None;
            }
            self.fill();
        }
        self.batch.pop_front()
    }
}
