//! Index descriptor.

use nidx_common::{IndexError, Result};

/// Identity and shape of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Index id, unique within a database.
    pub id: u64,
    /// Human readable name, also used to name the index files.
    pub name: String,
    /// Number of properties per key.
    pub slot_count: usize,
    /// Whether two entities may share a value.
    pub unique: bool,
}

impl IndexDescriptor {
    /// Creates a non-unique index descriptor.
    pub fn new(id: u64, name: impl Into<String>, slot_count: usize) -> Self {
        Self {
            id,
            name: name.into(),
            slot_count,
            unique: false,
        }
    }

    /// Creates a uniqueness constraint index descriptor.
    pub fn unique(id: u64, name: impl Into<String>, slot_count: usize) -> Self {
        Self {
            unique: true,
            ..Self::new(id, name, slot_count)
        }
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Validates the descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(IndexError::ConfigError(format!(
                "index '{}' must cover at least one property",
                self.name
            )));
        }
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(IndexError::ConfigError(format!(
                "invalid index name '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.unique { "unique" } else { "range" };
        write!(f, "Index( id={}, name='{}', type={} )", self.id, self.name, kind)
    }
}
