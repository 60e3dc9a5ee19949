//! Typed index keys.
//!
//! An `IndexKey` is an entity id plus one `KeySlot` per indexed property.
//! Keys order by their slots first and use the entity id only as the final
//! tie-break, so all entries for one value sit next to each other.

mod codec;
mod slot;

pub use codec::{read_slot, slot_size, write_slot, SLOT_HEADER_SIZE};
pub use slot::{Inclusion, KeySlot, Scalar, SlotValue};

use crate::spatial::SpaceFillingCurve;
use bytes::{Buf, BufMut};
use nidx_common::{IndexError, Result, Value, ValueGroup};
use std::cmp::Ordering;

/// Identifier of an indexed entity.
pub type EntityId = i64;

/// Entity id of keys that carry no entity, such as minimal splitters.
///
/// Sorts below every real entity id, negative ones included.
pub const NO_ENTITY_ID: EntityId = EntityId::MIN;

/// Size of the encoded entity id.
pub const ENTITY_ID_SIZE: usize = 8;

/// A composite index key.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
    entity_id: EntityId,
    slots: Vec<KeySlot>,
}

impl IndexKey {
    /// Creates a cleared key with `slot_count` slots.
    pub fn new(slot_count: usize) -> Self {
        Self {
            entity_id: NO_ENTITY_ID,
            slots: (0..slot_count).map(|_| KeySlot::new()).collect(),
        }
    }

    /// Creates a key holding `values` for `entity_id`.
    pub fn from_values(
        entity_id: EntityId,
        values: &[Value],
        curve: &dyn SpaceFillingCurve,
    ) -> Result<Self> {
        let mut key = Self::new(values.len());
        key.init_from_values(entity_id, values, curve)?;
        Ok(key)
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn set_entity_id(&mut self, entity_id: EntityId) {
        self.entity_id = entity_id;
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &KeySlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut KeySlot {
        &mut self.slots[index]
    }

    pub fn slots(&self) -> &[KeySlot] {
        &self.slots
    }

    /// Overwrites this key with `values`, all with neutral inclusion.
    pub fn init_from_values(
        &mut self,
        entity_id: EntityId,
        values: &[Value],
        curve: &dyn SpaceFillingCurve,
    ) -> Result<()> {
        if values.len() != self.slots.len() {
            return Err(IndexError::InvalidArgument(format!(
                "key has {} slots, got {} values",
                self.slots.len(),
                values.len()
            )));
        }
        self.entity_id = entity_id;
        for (slot, value) in self.slots.iter_mut().zip(values) {
            slot.write_value(value, Inclusion::Neutral, curve)?;
        }
        Ok(())
    }

    /// Clears every slot, keeping text buffers for reuse.
    pub fn reset(&mut self) {
        self.entity_id = NO_ENTITY_ID;
        for slot in &mut self.slots {
            slot.reset();
        }
    }

    /// Sets this key below every other key.
    pub fn init_lowest(&mut self) {
        self.entity_id = EntityId::MIN;
        for slot in &mut self.slots {
            slot.init_lowest_of_all();
        }
    }

    /// Sets this key above every other key.
    pub fn init_highest(&mut self) {
        self.entity_id = EntityId::MAX;
        for slot in &mut self.slots {
            slot.init_highest_of_all();
        }
    }

    /// Sets this key to the lowest key whose first slot is in `group`.
    pub fn init_lowest_of(&mut self, group: ValueGroup) {
        self.init_lowest();
        if let Some(first) = self.slots.first_mut() {
            first.init_lowest(group);
        }
    }

    /// Sets this key to the highest key whose first slot is in `group`.
    pub fn init_highest_of(&mut self, group: ValueGroup) {
        self.init_highest();
        if let Some(first) = self.slots.first_mut() {
            first.init_highest(group);
        }
    }

    /// Copies out the slot values. Sentinel slots cannot be detached.
    pub fn to_values(&self) -> Result<Vec<Value>> {
        self.slots.iter().map(KeySlot::to_value).collect()
    }

    /// Exact encoded size of this key.
    pub fn size(&self) -> usize {
        ENTITY_ID_SIZE + self.slots.iter().map(slot_size).sum::<usize>()
    }

    /// Writes this key.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.entity_id);
        for slot in &self.slots {
            write_slot(slot, buf);
        }
    }

    /// Reads a key with this key's slot count from `buf`.
    pub fn read_from(&mut self, buf: &mut &[u8]) -> Result<()> {
        if buf.len() < ENTITY_ID_SIZE {
            return Err(IndexError::Corrupted("key truncated before entity id".to_string()));
        }
        self.entity_id = buf.get_i64_le();
        for slot in &mut self.slots {
            read_slot(slot, buf)?;
        }
        Ok(())
    }

    /// Compares slot values and inclusions, ignoring entity ids.
    pub fn compare_value(&self, other: &IndexKey) -> Ordering {
        for (a, b) in self.slots.iter().zip(&other.slots) {
            let c = a.compare(b);
            if c != Ordering::Equal {
                return c;
            }
        }
        self.slots.len().cmp(&other.slots.len())
    }

    /// Total key order: values first, entity id as tie-break.
    pub fn compare(&self, other: &IndexKey) -> Ordering {
        self.compare_value(other)
            .then(self.entity_id.cmp(&other.entity_id))
    }

    /// Exact value equality, comparing point coordinates rather than curve values.
    pub fn exact_value_eq(&self, other: &IndexKey) -> bool {
        self.slots.len() == other.slots.len()
            && self
                .slots
                .iter()
                .zip(&other.slots)
                .all(|(a, b)| a.exact_eq(b))
    }

    /// Writes into `into` the smallest key sorting after `left` and not after `right`.
    ///
    /// Slots before the first differing slot are copied, the differing slot
    /// is shortened where its type allows, and the entity id is dropped.
    /// When the keys differ only by entity id, `right` is copied as is.
    pub fn minimal_splitter(left: &IndexKey, right: &IndexKey, into: &mut IndexKey) {
        into.slots.resize_with(right.slots.len(), KeySlot::new);
        into.entity_id = right.entity_id;

        let mut split = false;
        for (i, (l, r)) in left.slots.iter().zip(&right.slots).enumerate() {
            if !split && l.compare(r) != Ordering::Equal {
                KeySlot::minimal_splitter(l, r, &mut into.slots[i]);
                split = true;
            } else {
                into.slots[i].clone_from(r);
            }
        }
        if split {
            into.entity_id = NO_ENTITY_ID;
        }
    }
}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match slot.to_value() {
                Ok(v) => write!(f, "{}", v)?,
                Err(_) => write!(f, "{:?}", slot.value())?,
            }
        }
        write!(f, ")")
    }
}
