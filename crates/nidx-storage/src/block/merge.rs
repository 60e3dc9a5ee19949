//! K-way merge of sorted key streams.
//!
//! A manual min-heap of stream indices orders the streams by their current
//! head key. Heads stay inside their streams, so merging never clones keys
//! except into the caller's output key.

use crate::layout::Layout;
use nidx_common::Result;
use std::cmp::Ordering;
use std::sync::Arc;

/// A forward-only stream of keys in ascending layout order.
pub trait MergeSource<K> {
    /// Current key, or `None` when exhausted.
    fn peek(&self) -> Option<&K>;

    /// Moves to the next key.
    fn advance(&mut self) -> Result<()>;
}

/// Merges any number of sorted sources into one sorted stream.
pub struct KWayMerge<L: Layout, S: MergeSource<L::Key>> {
    layout: Arc<L>,
    streams: Vec<S>,
    /// Indices of non-exhausted streams, as a min-heap on their head keys.
    heap: Vec<usize>,
    /// Set once a key was emitted, for deduplication.
    emitted: bool,
    last: L::Key,
}

impl<L: Layout, S: MergeSource<L::Key>> KWayMerge<L, S> {
    /// Creates a merge over `streams`, which must each already be positioned
    /// on their first key.
    pub fn new(layout: Arc<L>, streams: Vec<S>) -> Self {
        let heap: Vec<usize> = streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.peek().is_some())
            .map(|(i, _)| i)
            .collect();
        let last = layout.new_key();
        let mut me = Self {
            layout,
            streams,
            heap,
            emitted: false,
            last,
        };
        if me.heap.len() > 1 {
            let last_internal = (me.heap.len() / 2).saturating_sub(1);
            for i in (0..=last_internal).rev() {
                me.sift_down(i);
            }
        }
        me
    }

    /// Number of input streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn head(&self, pos: usize) -> Option<&L::Key> {
        self.streams[self.heap[pos]].peek()
    }

    /// Ties between equal keys go to the lower stream index, keeping the
    /// merge stable.
    fn heap_less(&self, i: usize, j: usize) -> bool {
        let ord = match (self.head(i), self.head(j)) {
            (Some(a), Some(b)) => self.layout.compare(a, b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        match ord {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.heap[i] < self.heap[j],
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap_less(right, left) {
                smallest = right;
            }
            if !self.heap_less(smallest, pos) {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    /// Writes the next key in merge order into `into`. Returns false when
    /// every stream is exhausted.
    pub fn next_into(&mut self, into: &mut L::Key) -> Result<bool> {
        let Some(&top) = self.heap.first() else {
            return Ok(false);
        };
        match self.streams[top].peek() {
            Some(key) => into.clone_from(key),
            None => return Ok(false),
        }
        self.streams[top].advance()?;
        if self.streams[top].peek().is_none() {
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
        }
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Ok(true)
    }

    /// Like `next_into`, but skips keys identical to the previous one,
    /// entity id included.
    pub fn next_deduped(&mut self, into: &mut L::Key) -> Result<bool> {
        loop {
            if !self.next_into(into)? {
                return Ok(false);
            }
            if self.emitted && self.layout.compare(&self.last, into) == Ordering::Equal {
                continue;
            }
            self.last.clone_from(into);
            self.emitted = true;
            return Ok(true);
        }
    }

    /// Gives the sources back.
    pub fn into_streams(self) -> Vec<S> {
        self.streams
    }
}

/// A merge source over an in-memory sorted vector.
pub struct VecSource<K> {
    keys: Vec<K>,
    pos: usize,
}

impl<K> VecSource<K> {
    pub fn new(keys: Vec<K>) -> Self {
        Self { keys, pos: 0 }
    }
}

impl<K> MergeSource<K> for VecSource<K> {
    fn peek(&self) -> Option<&K> {
        self.keys.get(self.pos)
    }

    fn advance(&mut self) -> Result<()> {
        if self.pos < self.keys.len() {
            self.pos += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::IndexKey;
    use crate::layout::GenericLayout;
    use nidx_common::Value;

    fn keys(layout: &GenericLayout, entries: &[(i64, i64)]) -> Vec<IndexKey> {
        entries
            .iter()
            .map(|(entity, v)| layout.key_of(*entity, &[Value::Int(*v)]).unwrap())
            .collect()
    }

    fn drain(merge: &mut KWayMerge<GenericLayout, VecSource<IndexKey>>, dedup: bool) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        let mut key = IndexKey::new(1);
        loop {
            let more = if dedup {
                merge.next_deduped(&mut key).unwrap()
            } else {
                merge.next_into(&mut key).unwrap()
            };
            if !more {
                break;
            }
            let values = key.to_values().unwrap();
            let v = match &values[0] {
                Value::Int(v) => *v,
                other => panic!("unexpected value {}", other),
            };
            out.push((key.entity_id(), v));
        }
        out
    }

    #[test]
    fn test_merge_orders_streams() {
        let layout = Arc::new(GenericLayout::new(1));
        let streams = vec![
            VecSource::new(keys(&layout, &[(1, 1), (4, 7), (2, 9)])),
            VecSource::new(Vec::new()),
            VecSource::new(keys(&layout, &[(3, 2), (5, 7)])),
            VecSource::new(keys(&layout, &[(6, 0)])),
        ];
        let mut merge = KWayMerge::new(Arc::clone(&layout), streams);
        assert_eq!(merge.stream_count(), 4);
        assert_eq!(
            drain(&mut merge, false),
            vec![(6, 0), (1, 1), (3, 2), (4, 7), (5, 7), (2, 9)]
        );
    }

    #[test]
    fn test_merge_dedup_identical_keys() {
        let layout = Arc::new(GenericLayout::new(1));
        let streams = vec![
            VecSource::new(keys(&layout, &[(1, 1), (2, 5)])),
            VecSource::new(keys(&layout, &[(1, 1), (3, 5)])),
            VecSource::new(keys(&layout, &[(1, 1), (2, 5)])),
        ];
        let mut merge = KWayMerge::new(Arc::clone(&layout), streams);
        assert_eq!(drain(&mut merge, true), vec![(1, 1), (2, 5), (3, 5)]);
    }

    #[test]
    fn test_merge_of_nothing() {
        let layout = Arc::new(GenericLayout::new(1));
        let mut merge: KWayMerge<GenericLayout, VecSource<IndexKey>> =
            KWayMerge::new(layout, Vec::new());
        assert!(drain(&mut merge, false).is_empty());
    }
}
