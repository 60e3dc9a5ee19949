//! Page structures and on-disk format constants for index files.

use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// Page size of index tree files in bytes (8 KB).
pub const PAGE_SIZE: usize = 8 * 1024;

/// Page number within an index file.
pub type PageNum = u32;

/// Sentinel for "no page" in sibling and child pointers.
pub const NO_PAGE: PageNum = u32::MAX;

/// Largest encoded key accepted into an index.
///
/// Chosen so that any node holds at least four maximum-size entries with
/// their framing, which keeps splits well-formed.
pub const MAX_ENTRY_SIZE: usize = (PAGE_SIZE - PageHeader::SIZE) / 4 - 8;

/// Format version persisted in every on-disk index structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: i32,
    pub minor: i32,
}

impl FormatVersion {
    /// Creates a new format version.
    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// Fails unless `found` can be opened by code written for `self`.
    ///
    /// Major versions must match exactly. Newer minor versions are rejected,
    /// older ones are readable.
    pub fn check_compatible(&self, found: FormatVersion) -> Result<()> {
        if found.major != self.major || found.minor > self.minor {
            return Err(IndexError::IncompatibleVersion {
                found_major: found.major,
                found_minor: found.minor,
                expected_major: self.major,
                expected_minor: self.minor,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Page types in an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Unallocated/free page.
    Free = 0,
    /// Index header page (always page 0).
    Meta = 1,
    /// Tree leaf page.
    Leaf = 2,
    /// Tree internal page.
    Internal = 3,
}

impl TryFrom<u8> for PageType {
    type Error = IndexError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Free),
            1 => Ok(PageType::Meta),
            2 => Ok(PageType::Leaf),
            3 => Ok(PageType::Internal),
            _ => Err(IndexError::Corrupted(format!("invalid page type: {}", value))),
        }
    }
}

/// Header at the beginning of every tree page.
///
/// Layout (32 bytes total):
/// - page_num: 4 bytes
/// - page_type: 1 byte
/// - level: 1 byte (0 for leaves)
/// - entry_count: 2 bytes
/// - prev: 4 bytes (left sibling on the same level)
/// - next: 4 bytes (right sibling on the same level)
/// - checksum: 4 bytes (CRC32 of the page with this field zeroed)
/// - reserved: 12 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    pub page_num: PageNum,
    pub page_type: PageType,
    pub level: u8,
    pub entry_count: u16,
    pub prev: PageNum,
    pub next: PageNum,
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    const CHECKSUM_RANGE: std::ops::Range<usize> = 16..20;

    /// Creates a new page header with no siblings.
    pub fn new(page_num: PageNum, page_type: PageType, level: u8) -> Self {
        Self {
            page_num,
            page_type,
            level,
            entry_count: 0,
            prev: NO_PAGE,
            next: NO_PAGE,
            checksum: 0,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_num.to_le_bytes());
        buf[4] = self.page_type as u8;
        buf[5] = self.level;
        buf[6..8].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.prev.to_le_bytes());
        buf[12..16].copy_from_slice(&self.next.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(IndexError::Corrupted(format!(
                "page header needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            page_num: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            page_type: PageType::try_from(buf[4])?,
            level: buf[5],
            entry_count: u16::from_le_bytes([buf[6], buf[7]]),
            prev: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            next: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            checksum: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }

    /// Computes the checksum of a full page, ignoring the stored checksum.
    pub fn compute_checksum(page: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page[..Self::CHECKSUM_RANGE.start]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page[Self::CHECKSUM_RANGE.end..]);
        hasher.finalize()
    }

    /// Writes the checksum of `page` into its header.
    pub fn seal(page: &mut [u8]) {
        let checksum = Self::compute_checksum(page);
        page[Self::CHECKSUM_RANGE].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Reads the header of `page` and verifies its checksum.
    pub fn verify(page: &[u8]) -> Result<Self> {
        let header = Self::from_bytes(page)?;
        let expected = Self::compute_checksum(page);
        if header.checksum != expected {
            return Err(IndexError::Corrupted(format!(
                "page {} checksum mismatch",
                header.page_num
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 8192);
        assert_eq!(PageHeader::SIZE, 32);
    }

    #[test]
    fn test_max_entry_size_fits_four_per_page() {
        assert!(4 * (MAX_ENTRY_SIZE + 8) <= PAGE_SIZE - PageHeader::SIZE);
    }

    #[test]
    fn test_format_version_compat() {
        let current = FormatVersion::new(1, 2);
        assert!(current.check_compatible(FormatVersion::new(1, 2)).is_ok());
        assert!(current.check_compatible(FormatVersion::new(1, 0)).is_ok());
        assert!(matches!(
            current.check_compatible(FormatVersion::new(1, 3)),
            Err(IndexError::IncompatibleVersion { .. })
        ));
        assert!(current.check_compatible(FormatVersion::new(2, 0)).is_err());
        assert_eq!(current.to_string(), "1.2");
    }

    #[test]
    fn test_page_type_repr() {
        assert_eq!(PageType::Free as u8, 0);
        assert_eq!(PageType::Meta as u8, 1);
        assert_eq!(PageType::Leaf as u8, 2);
        assert_eq!(PageType::Internal as u8, 3);
        assert!(PageType::try_from(9).is_err());
    }

    #[test]
    fn test_page_header_roundtrip() {
        let mut header = PageHeader::new(7, PageType::Leaf, 0);
        header.entry_count = 42;
        header.prev = 3;
        header.next = 11;

        let bytes = header.to_bytes();
        let decoded = PageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_page_header_new_has_no_siblings() {
        let header = PageHeader::new(1, PageType::Internal, 2);
        assert_eq!(header.prev, NO_PAGE);
        assert_eq!(header.next, NO_PAGE);
        assert_eq!(header.level, 2);
    }

    #[test]
    fn test_page_seal_and_verify() {
        let mut page = vec![0u8; PAGE_SIZE];
        let header = PageHeader::new(5, PageType::Leaf, 0);
        page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        page[100] = 0xAB;

        PageHeader::seal(&mut page);
        let verified = PageHeader::verify(&page).unwrap();
        assert_eq!(verified.page_num, 5);

        page[200] ^= 0xFF;
        assert!(matches!(
            PageHeader::verify(&page),
            Err(IndexError::Corrupted(_))
        ));
    }

    #[test]
    fn test_page_header_short_buffer() {
        assert!(PageHeader::from_bytes(&[0u8; 10]).is_err());
    }
}
