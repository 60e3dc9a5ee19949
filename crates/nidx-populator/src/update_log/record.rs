//! Update log record format.

use crate::update::UpdateMode;
use bytes::{Buf, BufMut, BytesMut};
use nidx_common::{IndexError, Result};
use nidx_storage::Layout;

impl TryFrom<u8> for UpdateMode {
    type Error = IndexError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(UpdateMode::Added),
            2 => Ok(UpdateMode::Changed),
            3 => Ok(UpdateMode::Removed),
            _ => Err(IndexError::Corrupted(format!(
                "invalid update mode: {}",
                value
            ))),
        }
    }
}

/// One external update in encoded key form.
///
/// Record format on disk:
/// - body_len: 4 bytes
/// - body:
///   - mode: 1 byte
///   - key_len: 4 bytes, key
///   - (changed only) key2_len: 4 bytes, key2
/// - checksum: 4 bytes (CRC32 of body)
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord<K> {
    pub mode: UpdateMode,
    /// Added or removed key, or the key before a change.
    pub key: K,
    /// The key after a change.
    pub key2: Option<K>,
}

impl<K> UpdateRecord<K> {
    pub const LEN_SIZE: usize = 4;
    pub const CHECKSUM_SIZE: usize = 4;

    pub fn added(key: K) -> Self {
        Self {
            mode: UpdateMode::Added,
            key,
            key2: None,
        }
    }

    pub fn changed(before: K, after: K) -> Self {
        Self {
            mode: UpdateMode::Changed,
            key: before,
            key2: Some(after),
        }
    }

    pub fn removed(key: K) -> Self {
        Self {
            mode: UpdateMode::Removed,
            key,
            key2: None,
        }
    }
}

fn put_key<L: Layout>(layout: &L, key: &L::Key, buf: &mut BytesMut) {
    buf.put_u32_le(layout.key_size(key) as u32);
    layout.write_key(key, buf);
}

fn get_key<L: Layout>(layout: &L, data: &mut &[u8]) -> Result<L::Key> {
    if data.len() < 4 {
        return Err(IndexError::Corrupted("truncated update key length".to_string()));
    }
    let len = data.get_u32_le() as usize;
    if data.len() < len {
        return Err(IndexError::Corrupted("truncated update key".to_string()));
    }
    let mut key_bytes = &data[..len];
    let mut key = layout.new_key();
    layout.read_key(&mut key_bytes, &mut key)?;
    data.advance(len);
    Ok(key)
}

/// Serializes a record, framed and checksummed.
pub fn encode_record<L: Layout>(layout: &L, record: &UpdateRecord<L::Key>, buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u32_le(0);
    buf.put_u8(record.mode as u8);
    put_key(layout, &record.key, buf);
    if let Some(key2) = &record.key2 {
        put_key(layout, key2, buf);
    }
    let body_len = buf.len() - start - UpdateRecord::<L::Key>::LEN_SIZE;
    buf[start..start + 4].copy_from_slice(&(body_len as u32).to_le_bytes());
    let checksum = crc32fast::hash(&buf[start + 4..]);
    buf.put_u32_le(checksum);
}

/// Deserializes a record body, verifying its checksum.
pub fn decode_record<L: Layout>(
    layout: &L,
    body: &[u8],
    stored_checksum: u32,
) -> Result<UpdateRecord<L::Key>> {
    let computed = crc32fast::hash(body);
    if computed != stored_checksum {
        return Err(IndexError::Corrupted(format!(
            "update record checksum mismatch: stored={}, computed={}",
            stored_checksum, computed
        )));
    }
    let mut data = body;
    if data.is_empty() {
        return Err(IndexError::Corrupted("empty update record".to_string()));
    }
    let mode = UpdateMode::try_from(data.get_u8())?;
    let key = get_key(layout, &mut data)?;
    let key2 = match mode {
        UpdateMode::Changed => Some(get_key(layout, &mut data)?),
        _ => None,
    };
    if !data.is_empty() {
        return Err(IndexError::Corrupted(format!(
            "{} trailing bytes in update record",
            data.len()
        )));
    }
    Ok(UpdateRecord { mode, key, key2 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nidx_common::Value;
    use nidx_storage::GenericLayout;

    fn split(buf: &[u8]) -> (&[u8], u32) {
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let body = &buf[4..4 + len];
        let checksum = u32::from_le_bytes(buf[4 + len..8 + len].try_into().unwrap());
        (body, checksum)
    }

    #[test]
    fn test_changed_record_roundtrip() {
        let layout = GenericLayout::new(1);
        let before = layout.key_of(5, &[Value::text("old")]).unwrap();
        let after = layout.key_of(5, &[Value::text("new")]).unwrap();
        let record = UpdateRecord::changed(before, after);

        let mut buf = BytesMut::new();
        encode_record(&layout, &record, &mut buf);
        let (body, checksum) = split(&buf);
        assert_eq!(buf.len(), body.len() + 8);

        let decoded = decode_record(&layout, body, checksum).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_removed_record_with_wide_key_roundtrip() {
        let layout = GenericLayout::new(2);
        let wide = "w".repeat(40_000);
        let key = layout
            .key_of(3, &[Value::text(wide.clone()), Value::text(wide)])
            .unwrap();
        assert!(layout.key_size(&key) > u16::MAX as usize);
        let record = UpdateRecord::removed(key);

        let mut buf = BytesMut::new();
        encode_record(&layout, &record, &mut buf);
        let (body, checksum) = split(&buf);
        assert_eq!(decode_record(&layout, body, checksum).unwrap(), record);
    }

    #[test]
    fn test_checksum_mismatch() {
        let layout = GenericLayout::new(1);
        let record = UpdateRecord::added(layout.key_of(1, &[Value::Int(9)]).unwrap());
        let mut buf = BytesMut::new();
        encode_record(&layout, &record, &mut buf);
        buf[6] ^= 0xFF;
        let (body, checksum) = split(&buf);
        assert!(matches!(
            decode_record(&layout, body, checksum),
            Err(IndexError::Corrupted(_))
        ));
    }

    #[test]
    fn test_invalid_mode() {
        assert!(UpdateMode::try_from(0).is_err());
        assert_eq!(UpdateMode::try_from(3).unwrap(), UpdateMode::Removed);
    }
}
