//! Index entry updates.

use nidx_common::Value;
use nidx_storage::EntityId;

/// Kind of change carried by an `IndexEntryUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateMode {
    Added = 1,
    Changed = 2,
    Removed = 3,
}

/// A change to the indexed values of one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEntryUpdate {
    Added {
        entity_id: EntityId,
        values: Vec<Value>,
    },
    Changed {
        entity_id: EntityId,
        before: Vec<Value>,
        after: Vec<Value>,
    },
    Removed {
        entity_id: EntityId,
        values: Vec<Value>,
    },
}

impl IndexEntryUpdate {
    pub fn added(entity_id: EntityId, values: Vec<Value>) -> Self {
        IndexEntryUpdate::Added { entity_id, values }
    }

    pub fn changed(entity_id: EntityId, before: Vec<Value>, after: Vec<Value>) -> Self {
        IndexEntryUpdate::Changed {
            entity_id,
            before,
            after,
        }
    }

    pub fn removed(entity_id: EntityId, values: Vec<Value>) -> Self {
        IndexEntryUpdate::Removed { entity_id, values }
    }

    pub fn entity_id(&self) -> EntityId {
        match self {
            IndexEntryUpdate::Added { entity_id, .. }
            | IndexEntryUpdate::Changed { entity_id, .. }
            | IndexEntryUpdate::Removed { entity_id, .. } => *entity_id,
        }
    }

    pub fn mode(&self) -> UpdateMode {
        match self {
            IndexEntryUpdate::Added { .. } => UpdateMode::Added,
            IndexEntryUpdate::Changed { .. } => UpdateMode::Changed,
            IndexEntryUpdate::Removed { .. } => UpdateMode::Removed,
        }
    }

    /// The values the entity holds after this update, if any.
    pub fn values(&self) -> Option<&[Value]> {
        match self {
            IndexEntryUpdate::Added { values, .. } => Some(values),
            IndexEntryUpdate::Changed { after, .. } => Some(after),
            IndexEntryUpdate::Removed { .. } => None,
        }
    }
}

impl std::fmt::Display for IndexEntryUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexEntryUpdate::Added { entity_id, values } => {
                write!(f, "ADDED({}, {:?})", entity_id, values)
            }
            IndexEntryUpdate::Changed {
                entity_id,
                before,
                after,
            } => write!(f, "CHANGED({}, {:?} -> {:?})", entity_id, before, after),
            IndexEntryUpdate::Removed { entity_id, values } => {
                write!(f, "REMOVED({}, {:?})", entity_id, values)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_accessors() {
        let add = IndexEntryUpdate::added(7, vec![Value::Int(1)]);
        assert_eq!(add.entity_id(), 7);
        assert_eq!(add.mode(), UpdateMode::Added);
        assert_eq!(add.values(), Some(&[Value::Int(1)][..]));

        let change = IndexEntryUpdate::changed(7, vec![Value::Int(1)], vec![Value::Int(2)]);
        assert_eq!(change.mode(), UpdateMode::Changed);
        assert_eq!(change.values(), Some(&[Value::Int(2)][..]));

        let remove = IndexEntryUpdate::removed(7, vec![Value::Int(2)]);
        assert_eq!(remove.mode(), UpdateMode::Removed);
        assert!(remove.values().is_none());
    }
}
