//! Index sampling.

use nidx_storage::Layout;
use std::cmp::Ordering;

/// Statistics describing the value distribution of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexSample {
    /// Entries in the index.
    pub index_size: u64,
    /// Distinct values among the sampled entries.
    pub unique_values: u64,
    /// Entries looked at to compute `unique_values`.
    pub sample_size: u64,
    /// Updates applied since the sample was taken.
    pub updates: u64,
}

impl IndexSample {
    pub fn new(index_size: u64, unique_values: u64, sample_size: u64) -> Self {
        Self {
            index_size,
            unique_values,
            sample_size,
            updates: 0,
        }
    }

    /// Sample of a unique index, where every entry holds its own value.
    pub fn unique(index_size: u64) -> Self {
        Self::new(index_size, index_size, index_size)
    }

    pub fn with_updates(mut self, updates: u64) -> Self {
        self.updates = updates;
        self
    }

    /// Fraction of sampled entries with a distinct value.
    pub fn selectivity(&self) -> f64 {
        if self.sample_size == 0 {
            1.0
        } else {
            self.unique_values as f64 / self.sample_size as f64
        }
    }
}

/// Counts entries and distinct values of an ascending key stream.
pub struct SampleBuilder<L: Layout> {
    previous: Option<L::Key>,
    entries: u64,
    unique_values: u64,
}

impl<L: Layout> Default for SampleBuilder<L> {
    fn default() -> Self {
        Self {
            previous: None,
            entries: 0,
            unique_values: 0,
        }
    }
}

impl<L: Layout> SampleBuilder<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Includes the next key. Keys must arrive in ascending order.
    pub fn include(&mut self, layout: &L, key: &L::Key) {
        self.entries += 1;
        match &mut self.previous {
            Some(previous) => {
                if layout.compare_value(previous, key) != Ordering::Equal {
                    self.unique_values += 1;
                }
                previous.clone_from(key);
            }
            None => {
                self.unique_values += 1;
                self.previous = Some(key.clone());
            }
        }
    }

    pub fn build(&self) -> IndexSample {
        IndexSample::new(self.entries, self.unique_values, self.entries)
    }
}
