//! One value slot of an index key.

use super::codec::check_lengths;
use crate::spatial::SpaceFillingCurve;
use nidx_common::value::{compare_floats, compare_int_float, compare_values};
use nidx_common::{
    ArrayValue, Date, Duration, IndexError, LocalDateTime, LocalTime, Point, Result, Value,
    ValueGroup, ZonedDateTime, ZonedTime,
};
use std::cmp::Ordering;

/// Where a key sits relative to stored keys holding the same value.
///
/// Stored keys are always `Neutral`. Query bounds use `Low` to sort before
/// every stored key with an equal value and `High` to sort after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Inclusion {
    Low = 0,
    Neutral = 1,
    High = 2,
}

impl Inclusion {
    pub(crate) fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Inclusion::Low),
            1 => Ok(Inclusion::Neutral),
            2 => Ok(Inclusion::High),
            _ => Err(IndexError::Corrupted(format!("invalid inclusion: {}", bits))),
        }
    }
}

/// A concrete, non-array value as held in a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// UTF-8 bytes. Splitter keys may hold a prefix cut inside a character.
    Text(Vec<u8>),
    Date(Date),
    LocalTime(LocalTime),
    ZonedTime(ZonedTime),
    LocalDateTime(LocalDateTime),
    ZonedDateTime(ZonedDateTime),
    Duration(Duration),
    /// A point together with its derived curve value.
    Point { point: Point, derived: u64 },
}

impl Scalar {
    /// Returns the value group of this scalar.
    pub fn group(&self) -> ValueGroup {
        match self {
            Scalar::Int(_) | Scalar::Float(_) => ValueGroup::Number,
            Scalar::Bool(_) => ValueGroup::Boolean,
            Scalar::Text(_) => ValueGroup::Text,
            Scalar::Date(_) => ValueGroup::Date,
            Scalar::LocalTime(_) => ValueGroup::LocalTime,
            Scalar::ZonedTime(_) => ValueGroup::ZonedTime,
            Scalar::LocalDateTime(_) => ValueGroup::LocalDateTime,
            Scalar::ZonedDateTime(_) => ValueGroup::ZonedDateTime,
            Scalar::Duration(_) => ValueGroup::Duration,
            Scalar::Point { .. } => ValueGroup::Geometry,
        }
    }

    /// Converts a scalar value. Text bytes are written into `scratch`.
    pub(crate) fn from_value(
        value: &Value,
        curve: &dyn SpaceFillingCurve,
        mut scratch: Vec<u8>,
    ) -> Result<Scalar> {
        Ok(match value {
            Value::Int(v) => Scalar::Int(*v),
            Value::Float(v) => Scalar::Float(*v),
            Value::Bool(v) => Scalar::Bool(*v),
            Value::Text(s) => {
                scratch.clear();
                scratch.extend_from_slice(s.as_bytes());
                Scalar::Text(scratch)
            }
            Value::Date(v) => Scalar::Date(*v),
            Value::LocalTime(v) => Scalar::LocalTime(*v),
            Value::ZonedTime(v) => Scalar::ZonedTime(*v),
            Value::LocalDateTime(v) => Scalar::LocalDateTime(*v),
            Value::ZonedDateTime(v) => Scalar::ZonedDateTime(*v),
            Value::Duration(v) => Scalar::Duration(*v),
            Value::Point(p) => Scalar::Point {
                point: *p,
                derived: curve.derive(p),
            },
            Value::Array(_) => {
                return Err(IndexError::InvalidArgument(
                    "arrays cannot be array elements".to_string(),
                ))
            }
        })
    }

    /// Copies this scalar out as an owned value.
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Scalar::Int(v) => Value::Int(*v),
            Scalar::Float(v) => Value::Float(*v),
            Scalar::Bool(v) => Value::Bool(*v),
            Scalar::Text(bytes) => Value::Text(
                String::from_utf8(bytes.clone())
                    .map_err(|e| IndexError::Corrupted(format!("invalid text in key: {}", e)))?,
            ),
            Scalar::Date(v) => Value::Date(*v),
            Scalar::LocalTime(v) => Value::LocalTime(*v),
            Scalar::ZonedTime(v) => Value::ZonedTime(*v),
            Scalar::LocalDateTime(v) => Value::LocalDateTime(*v),
            Scalar::ZonedDateTime(v) => Value::ZonedDateTime(*v),
            Scalar::Duration(v) => Value::Duration(*v),
            Scalar::Point { point, .. } => Value::Point(*point),
        })
    }

    /// Key order within a group.
    ///
    /// Identical to `compare_values` for every group except points, which
    /// order by curve value and treat equal curve values as equal.
    pub fn compare(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => a.cmp(b),
            (Scalar::Int(a), Scalar::Float(b)) => compare_int_float(*a, *b),
            (Scalar::Float(a), Scalar::Int(b)) => compare_int_float(*b, *a).reverse(),
            (Scalar::Float(a), Scalar::Float(b)) => compare_floats(*a, *b),
            (Scalar::Text(a), Scalar::Text(b)) => a.as_slice().cmp(b.as_slice()),
            (Scalar::Point { point: a, derived: da }, Scalar::Point { point: b, derived: db }) => {
                a.crs().code().cmp(&b.crs().code()).then(da.cmp(db))
            }
            (a, b) => {
                let by_group = a.group().cmp(&b.group());
                if by_group != Ordering::Equal {
                    return by_group;
                }
                // Remaining groups hold only copyable payloads.
                match (a.to_value(), b.to_value()) {
                    (Ok(va), Ok(vb)) => compare_values(&va, &vb),
                    _ => Ordering::Equal,
                }
            }
        }
    }

    /// Exact equality, using coordinates rather than curve values for points.
    pub fn exact_eq(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Point { point: a, .. }, Scalar::Point { point: b, .. }) => {
                nidx_common::value::compare_points(a, b) == Ordering::Equal
            }
            _ => self.compare(other) == Ordering::Equal,
        }
    }

    /// Gives up any owned text buffer so it can be reused.
    pub(crate) fn into_scratch(self) -> Option<Vec<u8>> {
        match self {
            Scalar::Text(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Contents of a key slot: a value, or a sentinel bounding a group or
/// the whole key space.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    /// Sorts before every other slot value.
    LowestOfAll,
    /// Sorts before every value of the group.
    LowestOf(ValueGroup),
    Scalar(Scalar),
    /// Homogeneous array. `element` is a scalar group.
    Array {
        element: ValueGroup,
        items: Vec<Scalar>,
    },
    /// Sorts after every value of the group.
    HighestOf(ValueGroup),
    /// Sorts after every other slot value.
    HighestOfAll,
}

impl SlotValue {
    /// Group this slot belongs to, or `None` for the global sentinels.
    pub fn group(&self) -> Option<ValueGroup> {
        match self {
            SlotValue::LowestOfAll | SlotValue::HighestOfAll => None,
            SlotValue::LowestOf(g) | SlotValue::HighestOf(g) => Some(*g),
            SlotValue::Scalar(s) => Some(s.group()),
            SlotValue::Array { element, .. } => element.array_of(),
        }
    }

    /// Sort rank: global sentinels outside every group, then group id,
    /// then position within the group.
    fn rank(&self) -> (u8, u8) {
        match self {
            SlotValue::LowestOfAll => (0, 0),
            SlotValue::HighestOfAll => (u8::MAX, 0),
            SlotValue::LowestOf(g) => (1 + *g as u8, 0),
            SlotValue::Scalar(s) => (1 + s.group() as u8, 1),
            SlotValue::Array { element, .. } => {
                (1 + element.array_of().map_or(0, |g| g as u8), 1)
            }
            SlotValue::HighestOf(g) => (1 + *g as u8, 2),
        }
    }

    /// Compares slot values, ignoring inclusion.
    pub fn compare(&self, other: &SlotValue) -> Ordering {
        let by_rank = self.rank().cmp(&other.rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (self, other) {
            (SlotValue::Scalar(a), SlotValue::Scalar(b)) => a.compare(b),
            (SlotValue::Array { items: a, .. }, SlotValue::Array { items: b, .. }) => {
                for (x, y) in a.iter().zip(b) {
                    let c = x.compare(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }
}

/// One slot of an index key: a value plus its inclusion marker.
///
/// A slot keeps a spare byte buffer so text decoded into the same slot over
/// and over reuses one allocation. Values handed out by `to_value` are owned
/// copies and never alias that buffer.
#[derive(Debug, Clone)]
pub struct KeySlot {
    value: SlotValue,
    inclusion: Inclusion,
    spare: Vec<u8>,
}

impl PartialEq for KeySlot {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.inclusion == other.inclusion
    }
}

impl Default for KeySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySlot {
    /// Creates a cleared slot (lowest of all, neutral).
    pub fn new() -> Self {
        Self {
            value: SlotValue::LowestOfAll,
            inclusion: Inclusion::Neutral,
            spare: Vec::new(),
        }
    }

    pub fn value(&self) -> &SlotValue {
        &self.value
    }

    pub fn inclusion(&self) -> Inclusion {
        self.inclusion
    }

    pub fn set_inclusion(&mut self, inclusion: Inclusion) {
        self.inclusion = inclusion;
    }

    /// Clears the slot, keeping any text buffer for reuse.
    pub fn reset(&mut self) {
        self.set_value(SlotValue::LowestOfAll);
        self.inclusion = Inclusion::Neutral;
    }

    /// Replaces the slot content, recycling buffers of the old content.
    pub fn set_value(&mut self, value: SlotValue) {
        let old = std::mem::replace(&mut self.value, value);
        self.recycle(old);
    }

    fn recycle(&mut self, old: SlotValue) {
        let buf = match old {
            SlotValue::Scalar(s) => s.into_scratch(),
            SlotValue::Array { items, .. } => items.into_iter().find_map(Scalar::into_scratch),
            _ => None,
        };
        if let Some(mut buf) = buf {
            if buf.capacity() > self.spare.capacity() {
                buf.clear();
                self.spare = buf;
            }
        }
    }

    /// Takes the spare buffer, cleared, for decoding text into.
    pub(crate) fn take_spare(&mut self) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.spare);
        buf.clear();
        buf
    }

    /// Encodes a value into this slot.
    pub fn write_value(
        &mut self,
        value: &Value,
        inclusion: Inclusion,
        curve: &dyn SpaceFillingCurve,
    ) -> Result<()> {
        let slot_value = match value {
            Value::Array(array) => array_slot(array, curve)?,
            other => {
                // Release the current text buffer before reusing it.
                self.set_value(SlotValue::LowestOfAll);
                let scratch = self.take_spare();
                SlotValue::Scalar(Scalar::from_value(other, curve, scratch)?)
            }
        };
        check_lengths(&slot_value)?;
        self.set_value(slot_value);
        self.inclusion = inclusion;
        Ok(())
    }

    /// Sets this slot to the lowest key of `group`.
    pub fn init_lowest(&mut self, group: ValueGroup) {
        self.set_value(SlotValue::LowestOf(group));
        self.inclusion = Inclusion::Neutral;
    }

    /// Sets this slot to the highest key of `group`.
    pub fn init_highest(&mut self, group: ValueGroup) {
        self.set_value(SlotValue::HighestOf(group));
        self.inclusion = Inclusion::Neutral;
    }

    /// Sets this slot below every possible value.
    pub fn init_lowest_of_all(&mut self) {
        self.set_value(SlotValue::LowestOfAll);
        self.inclusion = Inclusion::Neutral;
    }

    /// Sets this slot above every possible value.
    pub fn init_highest_of_all(&mut self) {
        self.set_value(SlotValue::HighestOfAll);
        self.inclusion = Inclusion::Neutral;
    }

    /// Copies the slot content out as an owned value.
    pub fn to_value(&self) -> Result<Value> {
        match &self.value {
            SlotValue::Scalar(s) => s.to_value(),
            SlotValue::Array { element, items } => {
                let values = items
                    .iter()
                    .map(Scalar::to_value)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(ArrayValue::new(*element, values)?))
            }
            other => Err(IndexError::InvalidState(format!(
                "sentinel slot {:?} has no value",
                other
            ))),
        }
    }

    /// Compares value then inclusion.
    pub fn compare(&self, other: &KeySlot) -> Ordering {
        self.value
            .compare(&other.value)
            .then(self.inclusion.cmp(&other.inclusion))
    }

    /// Exact value equality: points compare by coordinates.
    pub fn exact_eq(&self, other: &KeySlot) -> bool {
        match (&self.value, &other.value) {
            (SlotValue::Scalar(a), SlotValue::Scalar(b)) => a.exact_eq(b),
            (SlotValue::Array { items: a, .. }, SlotValue::Array { items: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.exact_eq(y))
            }
            (a, b) => a.compare(b) == Ordering::Equal,
        }
    }

    /// Writes the smallest slot that sorts after `left` and not after `right`.
    ///
    /// `left` must sort strictly before `right`.
    pub fn minimal_splitter(left: &KeySlot, right: &KeySlot, into: &mut KeySlot) {
        let splitter = match (&left.value, &right.value) {
            (SlotValue::Scalar(Scalar::Text(l)), SlotValue::Scalar(Scalar::Text(r))) => {
                let mut bytes = into.take_spare();
                bytes.extend_from_slice(&r[..text_split_len(l, r)]);
                SlotValue::Scalar(Scalar::Text(bytes))
            }
            (
                SlotValue::Array { element: le, items: l },
                SlotValue::Array { element: re, items: r },
            ) if le == re => {
                let common = l
                    .iter()
                    .zip(r)
                    .take_while(|(a, b)| a.compare(b) == Ordering::Equal)
                    .count();
                let len = (common + 1).min(r.len());
                SlotValue::Array {
                    element: *re,
                    items: r[..len].to_vec(),
                }
            }
            (_, value) => value.clone(),
        };
        into.set_value(splitter);
        into.inclusion = right.inclusion;
    }
}

/// Length of the shortest prefix of `right` that sorts after `left`.
fn text_split_len(left: &[u8], right: &[u8]) -> usize {
    let common = left
        .iter()
        .zip(right)
        .take_while(|(a, b)| a == b)
        .count();
    (common + 1).min(right.len())
}

fn array_slot(array: &ArrayValue, curve: &dyn SpaceFillingCurve) -> Result<SlotValue> {
    let items = array
        .items()
        .iter()
        .map(|v| Scalar::from_value(v, curve, Vec::new()))
        .collect::<Result<Vec<_>>>()?;
    Ok(SlotValue::Array {
        element: array.element_group(),
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::ZOrderCurve;

    fn slot(value: Value) -> KeySlot {
        let curve = ZOrderCurve::default();
        let mut slot = KeySlot::new();
        slot.write_value(&value, Inclusion::Neutral, &curve).unwrap();
        slot
    }

    #[test]
    fn test_inclusion_orders_equal_values() {
        let curve = ZOrderCurve::default();
        let mut low = KeySlot::new();
        low.write_value(&Value::Int(5), Inclusion::Low, &curve).unwrap();
        let neutral = slot(Value::Int(5));
        let mut high = KeySlot::new();
        high.write_value(&Value::Int(5), Inclusion::High, &curve).unwrap();

        assert_eq!(low.compare(&neutral), Ordering::Less);
        assert_eq!(neutral.compare(&high), Ordering::Less);
        assert_eq!(high.compare(&slot(Value::Int(6))), Ordering::Less);
    }

    #[test]
    fn test_group_sentinels_bound_values() {
        let mut lowest = KeySlot::new();
        lowest.init_lowest(ValueGroup::Text);
        let mut highest = KeySlot::new();
        highest.init_highest(ValueGroup::Text);

        for text in ["", "a", "\u{10ffff}\u{10ffff}"] {
            let value = slot(Value::text(text));
            assert_eq!(lowest.compare(&value), Ordering::Less);
            assert_eq!(highest.compare(&value), Ordering::Greater);
        }
        assert_eq!(highest.compare(&slot(Value::Bool(false))), Ordering::Less);
    }

    #[test]
    fn test_text_splitter_prefix() {
        let left = slot(Value::text("abcd"));
        let right = slot(Value::text("abzz"));
        let mut into = KeySlot::new();
        KeySlot::minimal_splitter(&left, &right, &mut into);
        assert_eq!(
            into.value(),
            &SlotValue::Scalar(Scalar::Text(b"abz".to_vec()))
        );

        let left = slot(Value::text("ab"));
        let right = slot(Value::text("abc"));
        KeySlot::minimal_splitter(&left, &right, &mut into);
        assert_eq!(
            into.value(),
            &SlotValue::Scalar(Scalar::Text(b"abc".to_vec()))
        );
    }

    #[test]
    fn test_array_splitter_prefix() {
        let left = slot(Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(9)]).unwrap());
        let right = slot(Value::array(vec![Value::Int(1), Value::Int(3), Value::Int(0)]).unwrap());
        let mut into = KeySlot::new();
        KeySlot::minimal_splitter(&left, &right, &mut into);
        match into.value() {
            SlotValue::Array { items, .. } => assert_eq!(items.len(), 2),
            other => panic!("unexpected splitter {:?}", other),
        }
        assert_eq!(left.compare(&into), Ordering::Less);
        assert_ne!(into.compare(&right), Ordering::Greater);
    }

    #[test]
    fn test_to_value_copies_text() {
        let mut s = slot(Value::text("First string"));
        let detached = s.to_value().unwrap();
        let curve = ZOrderCurve::default();
        s.write_value(&Value::text("Secondstring"), Inclusion::Neutral, &curve)
            .unwrap();
        assert_eq!(detached, Value::text("First string"));
        assert_eq!(s.to_value().unwrap(), Value::text("Secondstring"));
    }

    #[test]
    fn test_sentinel_has_no_value() {
        let mut s = KeySlot::new();
        s.init_highest_of_all();
        assert!(matches!(s.to_value(), Err(IndexError::InvalidState(_))));
    }

    #[test]
    fn test_points_exact_eq_uses_coordinates() {
        let a = Scalar::Point {
            point: Point::cartesian(1.0, 1.0),
            derived: 7,
        };
        let b = Scalar::Point {
            point: Point::cartesian(1.0, 1.0000001),
            derived: 7,
        };
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert!(!a.exact_eq(&b));
    }

    #[test]
    fn test_text_longer_than_length_prefix_rejected() {
        let curve = ZOrderCurve::default();
        let mut slot = KeySlot::new();
        let long = Value::text("x".repeat(70_000));
        assert!(matches!(
            slot.write_value(&long, Inclusion::Neutral, &curve),
            Err(IndexError::OversizedEntry { size: 70_000, .. })
        ));
        let limit = Value::text("x".repeat(u16::MAX as usize));
        slot.write_value(&limit, Inclusion::Neutral, &curve).unwrap();
        assert_eq!(slot.to_value().unwrap(), limit);
    }

    #[test]
    fn test_reset_keeps_text_buffer() {
        let mut s = slot(Value::text("a fairly long piece of text"));
        s.reset();
        assert_eq!(s.value(), &SlotValue::LowestOfAll);
        assert!(s.spare.capacity() >= "a fairly long piece of text".len());
    }
}
