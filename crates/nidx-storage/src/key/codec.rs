//! Binary encoding of key slots.
//!
//! Each slot is written as a type byte, a flags byte, and a payload:
//!
//! - type: 0 lowest-of-all, `1 + group id` for a value group, 21 highest-of-all
//! - flags: bits 0-1 inclusion, bits 2-3 group sentinel (0 value, 1 lowest, 2 highest)
//!
//! Payloads are little-endian. Arrays carry a u16 item count followed by
//! the item payloads. Sentinels carry no payload.

use super::slot::{Inclusion, KeySlot, Scalar, SlotValue};
use bytes::{Buf, BufMut};
use nidx_common::{
    Crs, Date, Duration, IndexError, LocalDateTime, LocalTime, Point, Result, ValueGroup,
    ZonedDateTime, ZonedTime,
};

const TYPE_LOWEST_OF_ALL: u8 = 0;
const TYPE_HIGHEST_OF_ALL: u8 = 21;

const SENTINEL_NONE: u8 = 0;
const SENTINEL_LOWEST: u8 = 1;
const SENTINEL_HIGHEST: u8 = 2;

const NUMBER_INT: u8 = 0;
const NUMBER_FLOAT: u8 = 1;

/// Fixed per-slot overhead: type byte and flags byte.
pub const SLOT_HEADER_SIZE: usize = 2;

/// Longest text, in bytes, or array, in items, a slot can encode.
pub const MAX_SLOT_LENGTH: usize = u16::MAX as usize;

/// Fails if a text or array in `value` is too long for its length prefix.
pub fn check_lengths(value: &SlotValue) -> Result<()> {
    fn within(len: usize) -> Result<()> {
        if len > MAX_SLOT_LENGTH {
            return Err(IndexError::OversizedEntry {
                size: len,
                max: MAX_SLOT_LENGTH,
            });
        }
        Ok(())
    }
    match value {
        SlotValue::Scalar(Scalar::Text(bytes)) => within(bytes.len()),
        SlotValue::Array { items, .. } => {
            within(items.len())?;
            for item in items {
                if let Scalar::Text(bytes) = item {
                    within(bytes.len())?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Returns the encoded size of a slot.
pub fn slot_size(slot: &KeySlot) -> usize {
    SLOT_HEADER_SIZE
        + match slot.value() {
            SlotValue::Scalar(s) => scalar_size(s),
            SlotValue::Array { items, .. } => 2 + items.iter().map(scalar_size).sum::<usize>(),
            _ => 0,
        }
}

fn scalar_size(scalar: &Scalar) -> usize {
    match scalar {
        Scalar::Int(_) | Scalar::Float(_) => 9,
        Scalar::Bool(_) => 1,
        Scalar::Text(bytes) => 2 + bytes.len(),
        Scalar::Date(_) | Scalar::LocalTime(_) => 8,
        Scalar::ZonedTime(_) | Scalar::LocalDateTime(_) => 12,
        Scalar::ZonedDateTime(_) => 16,
        Scalar::Duration(_) => 28,
        Scalar::Point { point, .. } => 2 + 8 + 8 * point.crs().dimension(),
    }
}

/// Writes a slot.
pub fn write_slot(slot: &KeySlot, buf: &mut impl BufMut) {
    let (type_id, sentinel) = match slot.value() {
        SlotValue::LowestOfAll => (TYPE_LOWEST_OF_ALL, SENTINEL_NONE),
        SlotValue::HighestOfAll => (TYPE_HIGHEST_OF_ALL, SENTINEL_NONE),
        SlotValue::LowestOf(g) => (1 + *g as u8, SENTINEL_LOWEST),
        SlotValue::HighestOf(g) => (1 + *g as u8, SENTINEL_HIGHEST),
        SlotValue::Scalar(s) => (1 + s.group() as u8, SENTINEL_NONE),
        SlotValue::Array { element, .. } => (
            1 + element.array_of().map_or(ValueGroup::NumberArray as u8, |g| g as u8),
            SENTINEL_NONE,
        ),
    };
    buf.put_u8(type_id);
    buf.put_u8(slot.inclusion() as u8 | (sentinel << 2));

    match slot.value() {
        SlotValue::Scalar(s) => write_scalar(s, buf),
        SlotValue::Array { items, .. } => {
            buf.put_u16_le(items.len() as u16);
            for item in items {
                write_scalar(item, buf);
            }
        }
        _ => {}
    }
}

fn write_scalar(scalar: &Scalar, buf: &mut impl BufMut) {
    match scalar {
        Scalar::Int(v) => {
            buf.put_u8(NUMBER_INT);
            buf.put_i64_le(*v);
        }
        Scalar::Float(v) => {
            buf.put_u8(NUMBER_FLOAT);
            buf.put_u64_le(v.to_bits());
        }
        Scalar::Bool(v) => buf.put_u8(*v as u8),
        Scalar::Text(bytes) => {
            buf.put_u16_le(bytes.len() as u16);
            buf.put_slice(bytes);
        }
        Scalar::Date(d) => buf.put_i64_le(d.epoch_day),
        Scalar::LocalTime(t) => buf.put_i64_le(t.nanos_of_day),
        Scalar::ZonedTime(t) => {
            buf.put_i64_le(t.nanos_of_day_utc);
            buf.put_i32_le(t.offset_seconds);
        }
        Scalar::LocalDateTime(t) => {
            buf.put_i64_le(t.epoch_second);
            buf.put_i32_le(t.nanos);
        }
        Scalar::ZonedDateTime(t) => {
            buf.put_i64_le(t.epoch_second_utc);
            buf.put_i32_le(t.nanos);
            buf.put_i32_le(t.offset_seconds);
        }
        Scalar::Duration(d) => {
            buf.put_i64_le(d.months);
            buf.put_i64_le(d.days);
            buf.put_i64_le(d.seconds);
            buf.put_i32_le(d.nanos);
        }
        Scalar::Point { point, derived } => {
            buf.put_u16_le(point.crs().code());
            buf.put_u64_le(*derived);
            for c in point.coordinates() {
                buf.put_f64_le(*c);
            }
        }
    }
}

/// Fails unless `buf` holds at least `n` more bytes.
fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(IndexError::Corrupted(format!(
            "key truncated: need {} bytes, have {}",
            n,
            buf.len()
        )));
    }
    Ok(())
}

/// Reads a slot, reusing the slot's text buffer where possible.
pub fn read_slot(slot: &mut KeySlot, buf: &mut &[u8]) -> Result<()> {
    need(buf, SLOT_HEADER_SIZE)?;
    let type_id = buf.get_u8();
    let flags = buf.get_u8();
    let inclusion = Inclusion::from_bits(flags & 0b11)?;
    let sentinel = (flags >> 2) & 0b11;

    let value = match type_id {
        TYPE_LOWEST_OF_ALL => SlotValue::LowestOfAll,
        TYPE_HIGHEST_OF_ALL => SlotValue::HighestOfAll,
        id => {
            let group = ValueGroup::from_id(id - 1)
                .ok_or_else(|| IndexError::Corrupted(format!("invalid key type: {}", id)))?;
            match sentinel {
                SENTINEL_LOWEST => SlotValue::LowestOf(group),
                SENTINEL_HIGHEST => SlotValue::HighestOf(group),
                SENTINEL_NONE => match group.element_group() {
                    Some(element) => {
                        need(buf, 2)?;
                        let count = buf.get_u16_le() as usize;
                        let mut items = Vec::with_capacity(count);
                        for _ in 0..count {
                            items.push(read_scalar(element, buf, Vec::new())?);
                        }
                        SlotValue::Array { element, items }
                    }
                    None => {
                        slot.set_value(SlotValue::LowestOfAll);
                        let scratch = slot.take_spare();
                        SlotValue::Scalar(read_scalar(group, buf, scratch)?)
                    }
                },
                other => {
                    return Err(IndexError::Corrupted(format!(
                        "invalid sentinel flag: {}",
                        other
                    )))
                }
            }
        }
    };
    slot.set_value(value);
    slot.set_inclusion(inclusion);
    Ok(())
}

fn read_scalar(group: ValueGroup, buf: &mut &[u8], mut scratch: Vec<u8>) -> Result<Scalar> {
    Ok(match group {
        ValueGroup::Number => {
            need(buf, 9)?;
            match buf.get_u8() {
                NUMBER_INT => Scalar::Int(buf.get_i64_le()),
                NUMBER_FLOAT => Scalar::Float(f64::from_bits(buf.get_u64_le())),
                kind => {
                    return Err(IndexError::Corrupted(format!(
                        "invalid number kind: {}",
                        kind
                    )))
                }
            }
        }
        ValueGroup::Boolean => {
            need(buf, 1)?;
            Scalar::Bool(buf.get_u8() != 0)
        }
        ValueGroup::Text => {
            need(buf, 2)?;
            let len = buf.get_u16_le() as usize;
            need(buf, len)?;
            scratch.clear();
            scratch.extend_from_slice(&buf[..len]);
            buf.advance(len);
            Scalar::Text(scratch)
        }
        ValueGroup::Date => {
            need(buf, 8)?;
            Scalar::Date(Date {
                epoch_day: buf.get_i64_le(),
            })
        }
        ValueGroup::LocalTime => {
            need(buf, 8)?;
            Scalar::LocalTime(LocalTime {
                nanos_of_day: buf.get_i64_le(),
            })
        }
        ValueGroup::ZonedTime => {
            need(buf, 12)?;
            Scalar::ZonedTime(ZonedTime {
                nanos_of_day_utc: buf.get_i64_le(),
                offset_seconds: buf.get_i32_le(),
            })
        }
        ValueGroup::LocalDateTime => {
            need(buf, 12)?;
            Scalar::LocalDateTime(LocalDateTime {
                epoch_second: buf.get_i64_le(),
                nanos: buf.get_i32_le(),
            })
        }
        ValueGroup::ZonedDateTime => {
            need(buf, 16)?;
            Scalar::ZonedDateTime(ZonedDateTime {
                epoch_second_utc: buf.get_i64_le(),
                nanos: buf.get_i32_le(),
                offset_seconds: buf.get_i32_le(),
            })
        }
        ValueGroup::Duration => {
            need(buf, 28)?;
            Scalar::Duration(Duration {
                months: buf.get_i64_le(),
                days: buf.get_i64_le(),
                seconds: buf.get_i64_le(),
                nanos: buf.get_i32_le(),
            })
        }
        ValueGroup::Geometry => {
            need(buf, 10)?;
            let code = buf.get_u16_le();
            let crs = Crs::from_code(code)
                .ok_or_else(|| IndexError::Corrupted(format!("unknown crs: {}", code)))?;
            let derived = buf.get_u64_le();
            let dims = crs.dimension();
            need(buf, 8 * dims)?;
            let mut coords = [0.0f64; 3];
            for c in coords.iter_mut().take(dims) {
                *c = buf.get_f64_le();
            }
            Scalar::Point {
                point: Point::new(crs, &coords[..dims])?,
                derived,
            }
        }
        array => {
            return Err(IndexError::Corrupted(format!(
                "{} is not a scalar group",
                array
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::ZOrderCurve;
    use nidx_common::Value;

    fn roundtrip(slot: &KeySlot) -> KeySlot {
        let mut buf = Vec::new();
        write_slot(slot, &mut buf);
        assert_eq!(buf.len(), slot_size(slot));
        let mut read = KeySlot::new();
        let mut cursor: &[u8] = &buf;
        read_slot(&mut read, &mut cursor).unwrap();
        assert!(cursor.is_empty());
        read
    }

    #[test]
    fn test_sentinels_roundtrip() {
        let mut slot = KeySlot::new();
        slot.init_highest(ValueGroup::DateArray);
        assert_eq!(roundtrip(&slot), slot);
        slot.init_lowest(ValueGroup::Number);
        assert_eq!(roundtrip(&slot), slot);
        slot.init_highest_of_all();
        assert_eq!(roundtrip(&slot), slot);
        assert_eq!(slot_size(&slot), SLOT_HEADER_SIZE);
    }

    #[test]
    fn test_inclusion_roundtrip() {
        let curve = ZOrderCurve::default();
        let mut slot = KeySlot::new();
        slot.write_value(&Value::text("bound"), Inclusion::High, &curve)
            .unwrap();
        let read = roundtrip(&slot);
        assert_eq!(read.inclusion(), Inclusion::High);
        assert_eq!(read, slot);
    }

    #[test]
    fn test_truncated_input_is_corruption() {
        let curve = ZOrderCurve::default();
        let mut slot = KeySlot::new();
        slot.write_value(&Value::text("truncate me"), Inclusion::Neutral, &curve)
            .unwrap();
        let mut buf = Vec::new();
        write_slot(&slot, &mut buf);
        buf.truncate(buf.len() - 3);

        let mut cursor: &[u8] = &buf;
        let result = read_slot(&mut KeySlot::new(), &mut cursor);
        assert!(matches!(result, Err(IndexError::Corrupted(_))));
    }

    #[test]
    fn test_invalid_type_is_corruption() {
        let buf = [99u8, 1];
        let mut cursor: &[u8] = &buf;
        assert!(read_slot(&mut KeySlot::new(), &mut cursor).is_err());
    }
}
