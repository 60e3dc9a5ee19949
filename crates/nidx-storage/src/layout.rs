//! Key layout contract shared by block storage and the index tree.

use crate::key::{EntityId, IndexKey};
use crate::spatial::{SpaceFillingCurve, ZOrderCurve};
use bytes::BufMut;
use nidx_common::{FormatVersion, Result, Value, ValueGroup};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

/// How keys of one index are sized, ordered, serialized and split.
///
/// Block stores, merges and the tree only see keys through this trait.
pub trait Layout: Send + Sync + 'static {
    type Key: Clone + Debug + Send + Sync;

    /// Creates a cleared key for this layout.
    fn new_key(&self) -> Self::Key;

    /// Exact serialized size of `key`.
    fn key_size(&self, key: &Self::Key) -> usize;

    /// Total key order, entity id included.
    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Order of the key values alone.
    fn compare_value(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// True if both keys hold the same value, with exact point coordinates.
    fn exact_value_eq(&self, a: &Self::Key, b: &Self::Key) -> bool;

    fn entity_id(&self, key: &Self::Key) -> EntityId;

    fn set_entity_id(&self, key: &mut Self::Key, entity_id: EntityId);

    fn write_key<B: BufMut>(&self, key: &Self::Key, buf: &mut B);

    /// Reads a key into `into`, reusing its buffers.
    fn read_key(&self, buf: &mut &[u8], into: &mut Self::Key) -> Result<()>;

    /// Writes the smallest key sorting after `left` and not after `right`.
    fn minimal_splitter(&self, left: &Self::Key, right: &Self::Key, into: &mut Self::Key);

    fn init_lowest(&self, key: &mut Self::Key);

    fn init_highest(&self, key: &mut Self::Key);

    /// On-disk format version of structures using this layout.
    fn version(&self) -> FormatVersion;

    /// Human-readable value of a key, used in fault messages.
    fn describe_value(&self, key: &Self::Key) -> String;
}

/// Layout of composite keys over arbitrary property values.
#[derive(Clone)]
pub struct GenericLayout {
    slot_count: usize,
    curve: Arc<dyn SpaceFillingCurve>,
}

impl GenericLayout {
    /// Current key format version.
    pub const VERSION: FormatVersion = FormatVersion::new(1, 0);

    /// Creates a layout with `slot_count` slots and the default Z-order curve.
    pub fn new(slot_count: usize) -> Self {
        Self::with_curve(slot_count, Arc::new(ZOrderCurve::default()))
    }

    pub fn with_curve(slot_count: usize, curve: Arc<dyn SpaceFillingCurve>) -> Self {
        Self {
            slot_count: slot_count.max(1),
            curve,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn curve(&self) -> &dyn SpaceFillingCurve {
        self.curve.as_ref()
    }

    /// Encodes `values` for `entity_id` into `into`.
    pub fn encode(&self, entity_id: EntityId, values: &[Value], into: &mut IndexKey) -> Result<()> {
        into.init_from_values(entity_id, values, self.curve.as_ref())
    }

    /// Encodes `values` for `entity_id` into a new key.
    pub fn key_of(&self, entity_id: EntityId, values: &[Value]) -> Result<IndexKey> {
        let mut key = self.new_key();
        self.encode(entity_id, values, &mut key)?;
        Ok(key)
    }

    /// Sets `key` to the lowest key whose first slot is in `group`.
    pub fn init_lowest_of(&self, key: &mut IndexKey, group: ValueGroup) {
        key.init_lowest_of(group);
    }

    /// Sets `key` to the highest key whose first slot is in `group`.
    pub fn init_highest_of(&self, key: &mut IndexKey, group: ValueGroup) {
        key.init_highest_of(group);
    }
}

impl Debug for GenericLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericLayout")
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

impl Layout for GenericLayout {
    type Key = IndexKey;

    fn new_key(&self) -> IndexKey {
        IndexKey::new(self.slot_count)
    }

    fn key_size(&self, key: &IndexKey) -> usize {
        key.size()
    }

    fn compare(&self, a: &IndexKey, b: &IndexKey) -> Ordering {
        a.compare(b)
    }

    fn compare_value(&self, a: &IndexKey, b: &IndexKey) -> Ordering {
        a.compare_value(b)
    }

    fn exact_value_eq(&self, a: &IndexKey, b: &IndexKey) -> bool {
        a.exact_value_eq(b)
    }

    fn entity_id(&self, key: &IndexKey) -> EntityId {
        key.entity_id()
    }

    fn set_entity_id(&self, key: &mut IndexKey, entity_id: EntityId) {
        key.set_entity_id(entity_id);
    }

    fn write_key<B: BufMut>(&self, key: &IndexKey, buf: &mut B) {
        key.write_to(buf);
    }

    fn read_key(&self, buf: &mut &[u8], into: &mut IndexKey) -> Result<()> {
        into.read_from(buf)
    }

    fn minimal_splitter(&self, left: &IndexKey, right: &IndexKey, into: &mut IndexKey) {
        IndexKey::minimal_splitter(left, right, into);
    }

    fn init_lowest(&self, key: &mut IndexKey) {
        key.init_lowest();
    }

    fn init_highest(&self, key: &mut IndexKey) {
        key.init_highest();
    }

    fn version(&self) -> FormatVersion {
        Self::VERSION
    }

    fn describe_value(&self, key: &IndexKey) -> String {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_roundtrip() {
        let layout = GenericLayout::new(2);
        let key = layout
            .key_of(9, &[Value::Int(3), Value::text("x")])
            .unwrap();
        let mut buf = Vec::new();
        layout.write_key(&key, &mut buf);
        assert_eq!(buf.len(), layout.key_size(&key));

        let mut read = layout.new_key();
        let mut cursor: &[u8] = &buf;
        layout.read_key(&mut cursor, &mut read).unwrap();
        assert_eq!(layout.compare(&key, &read), Ordering::Equal);
        assert_eq!(layout.entity_id(&read), 9);
        assert_eq!(layout.describe_value(&read), "(3, \"x\")");
    }

    #[test]
    fn test_layout_bounds() {
        let layout = GenericLayout::new(1);
        let mut low = layout.new_key();
        let mut high = layout.new_key();
        layout.init_lowest(&mut low);
        layout.init_highest(&mut high);
        let key = layout.key_of(1, &[Value::Bool(false)]).unwrap();
        assert_eq!(layout.compare(&low, &key), Ordering::Less);
        assert_eq!(layout.compare(&high, &key), Ordering::Greater);
    }

    #[test]
    fn test_encode_checks_slot_count() {
        let layout = GenericLayout::new(2);
        assert!(layout.key_of(1, &[Value::Int(1)]).is_err());
    }
}
