//! Uniqueness conflict recording and verification.
//!
//! While scanned entries are loaded and external updates replayed, two
//! entities holding the same value are not an error yet: a later update may
//! still remove one of them. Such values are recorded in a spill store and
//! re-checked against the tree once every update has been applied.

use nidx_buffer::BufferArena;
use nidx_common::{IndexError, PopulationConfig, Result};
use nidx_storage::{BlockStore, Cancellation, IndexTree, Layout};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Records values seen on more than one entity of a unique index.
pub struct RecordingConflictDetector<L: Layout> {
    layout: Arc<L>,
    unique: bool,
    recorded: BlockStore<L>,
}

impl<L: Layout> RecordingConflictDetector<L> {
    /// Creates a detector spilling recorded keys to `path`. A detector for
    /// a non-unique index records nothing.
    pub fn new(
        layout: Arc<L>,
        unique: bool,
        arena: Arc<BufferArena>,
        path: impl Into<PathBuf>,
        config: &PopulationConfig,
    ) -> Self {
        Self {
            recorded: BlockStore::new(Arc::clone(&layout), arena, path, config),
            layout,
            unique,
        }
    }

    /// Number of recorded keys.
    pub fn recorded_count(&self) -> u64 {
        self.recorded.entry_count()
    }

    /// True if `a` and `b` belong to different entities with the same value.
    pub fn is_conflict(&self, a: &L::Key, b: &L::Key) -> bool {
        self.unique
            && self.layout.entity_id(a) != self.layout.entity_id(b)
            && self.layout.compare_value(a, b) == Ordering::Equal
    }

    /// Records `key` for later verification if it conflicts with `neighbor`.
    pub fn check(&mut self, neighbor: &L::Key, key: &L::Key) -> Result<bool> {
        if !self.is_conflict(neighbor, key) {
            return Ok(false);
        }
        self.recorded.add(key)?;
        Ok(true)
    }

    /// Re-checks every recorded value against the tree.
    ///
    /// Fails with `Conflict` naming the first two entities still sharing a
    /// value.
    pub fn verify(&mut self, tree: &IndexTree<L>, cancel: &Cancellation) -> Result<()> {
        if !self.unique {
            return Ok(());
        }
        self.recorded.done_adding()?;
        if self.recorded.is_empty() {
            return Ok(());
        }
        info!(
            recorded = self.recorded.entry_count(),
            "verifying recorded uniqueness conflicts"
        );

        let mut reader = self.recorded.reader()?;
        let mut key = self.layout.new_key();
        let mut last_checked: Option<L::Key> = None;
        let mut checked = 0u64;
        while reader.next_into(&mut key)? {
            cancel.check()?;
            if let Some(last) = &last_checked {
                if self.layout.compare_value(last, &key) == Ordering::Equal {
                    continue;
                }
            }
            self.verify_value(tree, &key)?;
            checked += 1;
            match &mut last_checked {
                Some(last) => last.clone_from(&key),
                None => last_checked = Some(key.clone()),
            }
        }
        debug!(values = checked, "uniqueness verified");
        Ok(())
    }

    fn verify_value(&self, tree: &IndexTree<L>, key: &L::Key) -> Result<()> {
        let entries = tree.value_entries(key);
        for (i, first) in entries.iter().enumerate() {
            for other in &entries[i + 1..] {
                if self.layout.exact_value_eq(first, other) {
                    return Err(IndexError::Conflict {
                        existing: self.layout.entity_id(first),
                        added: self.layout.entity_id(other),
                        value: self.layout.describe_value(other),
                    });
                }
            }
        }
        Ok(())
    }

    /// Deletes the spill file.
    pub fn close(&mut self) -> Result<()> {
        self.recorded.close()
    }
}

/// Scans a whole tree for entities sharing a value.
pub fn verify_tree_unique<L: Layout>(tree: &IndexTree<L>, cancel: &Cancellation) -> Result<()> {
    let layout = tree.layout();
    let mut group: Vec<L::Key> = Vec::new();
    for key in tree.scan(nidx_storage::SeekOrder::Ascending) {
        if let Some(first) = group.first() {
            if layout.compare_value(first, &key) != Ordering::Equal {
                check_group(layout.as_ref(), &group)?;
                group.clear();
                cancel.check()?;
            }
        }
        group.push(key);
    }
    check_group(layout.as_ref(), &group)
}

fn check_group<L: Layout>(layout: &L, group: &[L::Key]) -> Result<()> {
    for (i, first) in group.iter().enumerate() {
        for other in &group[i + 1..] {
            if layout.exact_value_eq(first, other) {
                return Err(IndexError::Conflict {
                    existing: layout.entity_id(first),
                    added: layout.entity_id(other),
                    value: layout.describe_value(other),
                });
            }
        }
    }
    Ok(())
}
