//! Index header page.
//!
//! Layout after the common page header:
//! ```text
//! +---------------------+ 32
//! | magic: [u8; 4]      | 36
//! | major: i32          | 40
//! | minor: i32          | 44
//! | state: u8           | 45
//! | root: u32           | 49
//! | height: u32         | 53
//! | node_count: u32     | 57
//! | entry_count: u64    | 65
//! | message_len: u16    | 67
//! | message: [u8]       |
//! +---------------------+
//! ```
//!
//! `message_len` is `u16::MAX` when there is no failure message.

use bytes::{Buf, BufMut};
use nidx_common::{FormatVersion, IndexError, PageHeader, PageType, Result, PAGE_SIZE};

/// Magic bytes identifying an index file.
pub const INDEX_MAGIC: [u8; 4] = *b"NIDX";

const FIXED_SIZE: usize = 4 + 4 + 4 + 1 + 4 + 4 + 4 + 8 + 2;

const NO_MESSAGE: u16 = u16::MAX;

/// Longest failure message stored in the header, in bytes.
pub const MAX_FAILURE_MESSAGE: usize = PAGE_SIZE - PageHeader::SIZE - FIXED_SIZE;

/// Persisted lifecycle state of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexState {
    Populating = 0,
    Online = 1,
    Failed = 2,
}

impl TryFrom<u8> for IndexState {
    type Error = IndexError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(IndexState::Populating),
            1 => Ok(IndexState::Online),
            2 => Ok(IndexState::Failed),
            _ => Err(IndexError::Corrupted(format!("invalid index state: {}", value))),
        }
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexState::Populating => write!(f, "POPULATING"),
            IndexState::Online => write!(f, "ONLINE"),
            IndexState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Contents of the header page.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHeader {
    pub version: FormatVersion,
    pub state: IndexState,
    pub root: u32,
    pub height: u32,
    pub node_count: u32,
    pub entry_count: u64,
    pub failure_message: Option<String>,
}

impl IndexHeader {
    pub fn new(version: FormatVersion) -> Self {
        Self {
            version,
            state: IndexState::Populating,
            root: 0,
            height: 1,
            node_count: 1,
            entry_count: 0,
            failure_message: None,
        }
    }

    /// Encodes the header into page 0 and seals it.
    pub fn write_page(&self, page: &mut [u8; PAGE_SIZE]) {
        page.fill(0);
        {
            let mut out: &mut [u8] = &mut page[PageHeader::SIZE..];
            out.put_slice(&INDEX_MAGIC);
            out.put_i32_le(self.version.major);
            out.put_i32_le(self.version.minor);
            out.put_u8(self.state as u8);
            out.put_u32_le(self.root);
            out.put_u32_le(self.height);
            out.put_u32_le(self.node_count);
            out.put_u64_le(self.entry_count);
            match &self.failure_message {
                Some(message) => {
                    let bytes = truncate_utf8(message, MAX_FAILURE_MESSAGE).as_bytes();
                    out.put_u16_le(bytes.len() as u16);
                    out.put_slice(bytes);
                }
                None => out.put_u16_le(NO_MESSAGE),
            }
        }
        page[..PageHeader::SIZE].copy_from_slice(&PageHeader::new(0, PageType::Meta, 0).to_bytes());
        PageHeader::seal(page);
    }

    /// Decodes and verifies the header page.
    ///
    /// Version compatibility is not checked here so callers can report
    /// the version they found.
    pub fn read_page(page: &[u8]) -> Result<Self> {
        let header = PageHeader::verify(page)?;
        if header.page_type != PageType::Meta {
            return Err(IndexError::Corrupted(format!(
                "expected header page, found {:?}",
                header.page_type
            )));
        }
        let mut input: &[u8] = &page[PageHeader::SIZE..];
        if input[..4] != INDEX_MAGIC {
            return Err(IndexError::Corrupted("not an index file".to_string()));
        }
        input.advance(4);
        let version = FormatVersion::new(input.get_i32_le(), input.get_i32_le());
        let state = IndexState::try_from(input.get_u8())?;
        let root = input.get_u32_le();
        let height = input.get_u32_le();
        let node_count = input.get_u32_le();
        let entry_count = input.get_u64_le();
        let failure_message = match input.get_u16_le() {
            NO_MESSAGE => None,
            len => {
                let len = len as usize;
                if len > input.len() {
                    return Err(IndexError::Corrupted("failure message truncated".to_string()));
                }
                Some(
                    std::str::from_utf8(&input[..len])
                        .map_err(|e| {
                            IndexError::Corrupted(format!("invalid failure message: {}", e))
                        })?
                        .to_string(),
                )
            }
        };
        Ok(Self {
            version,
            state,
            root,
            height,
            node_count,
            entry_count,
            failure_message,
        })
    }
}

/// Longest prefix of `s` of at most `max` bytes ending on a char boundary.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = IndexHeader::new(FormatVersion::new(1, 0));
        header.state = IndexState::Failed;
        header.root = 12;
        header.height = 3;
        header.node_count = 40;
        header.entry_count = 9000;
        header.failure_message = Some("conflict on \"x\"".to_string());

        let mut page = [0u8; PAGE_SIZE];
        header.write_page(&mut page);
        assert_eq!(IndexHeader::read_page(&page).unwrap(), header);
    }

    #[test]
    fn test_no_message_differs_from_empty_message() {
        let mut header = IndexHeader::new(FormatVersion::new(1, 0));
        let mut page = [0u8; PAGE_SIZE];
        header.write_page(&mut page);
        assert_eq!(IndexHeader::read_page(&page).unwrap().failure_message, None);

        header.failure_message = Some(String::new());
        header.write_page(&mut page);
        assert_eq!(
            IndexHeader::read_page(&page).unwrap().failure_message,
            Some(String::new())
        );
    }

    #[test]
    fn test_long_message_truncated_on_char_boundary() {
        let mut header = IndexHeader::new(FormatVersion::new(1, 0));
        // Three-byte characters never line up with the byte limit.
        let message = "\u{20ac}".repeat(MAX_FAILURE_MESSAGE);
        header.failure_message = Some(message);
        let mut page = [0u8; PAGE_SIZE];
        header.write_page(&mut page);

        let read = IndexHeader::read_page(&page).unwrap();
        let stored = read.failure_message.unwrap();
        assert!(stored.len() <= MAX_FAILURE_MESSAGE);
        assert!(stored.len() > MAX_FAILURE_MESSAGE - 3);
        assert!(stored.chars().all(|c| c == '\u{20ac}'));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let header = IndexHeader::new(FormatVersion::new(1, 0));
        let mut page = [0u8; PAGE_SIZE];
        header.write_page(&mut page);
        page[PageHeader::SIZE] = b'X';
        PageHeader::seal(&mut page);
        assert!(matches!(
            IndexHeader::read_page(&page),
            Err(IndexError::Corrupted(_))
        ));
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate_utf8("abc", 5), "abc");
        assert_eq!(truncate_utf8("ab\u{e9}", 3), "ab");
        assert_eq!(truncate_utf8("", 0), "");
    }
}
