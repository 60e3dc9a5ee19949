//! Cursors over spilled blocks.

use super::merge::{KWayMerge, MergeSource};
use super::store::{BlockInfo, BLOCK_HEADER_SIZE, ENTRY_LEN_SIZE};
use crate::layout::Layout;
use bytes::Buf;
use nidx_buffer::{BufferArena, ScopedBuffer};
use nidx_common::{IndexError, Result, MAX_ENTRY_SIZE};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// Forward-only cursor over the entries of one block.
///
/// Reads the block in chunks through an arena buffer, so the number of
/// open readers bounds merge memory.
pub struct BlockReader<L: Layout> {
    layout: Arc<L>,
    file: File,
    /// Block bytes not yet read from the file.
    unread: u64,
    /// Entries not yet decoded.
    entries_left: u64,
    buf: ScopedBuffer,
    current: L::Key,
    has_current: bool,
}

impl<L: Layout> BlockReader<L> {
    /// Opens a cursor positioned on the first entry of `block`.
    pub(crate) fn open(
        layout: Arc<L>,
        arena: &Arc<BufferArena>,
        path: &Path,
        block: &BlockInfo,
        read_buffer_size: usize,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(block.offset + BLOCK_HEADER_SIZE as u64))?;
        let buf = arena.allocate(read_buffer_size.max(MAX_ENTRY_SIZE + ENTRY_LEN_SIZE))?;
        let current = layout.new_key();
        let mut reader = Self {
            layout,
            file,
            unread: block.byte_len,
            entries_left: block.entry_count,
            buf,
            current,
            has_current: false,
        };
        reader.advance()?;
        Ok(reader)
    }

    /// Reads until at least `need` bytes are buffered or the block ends.
    fn fill(&mut self, need: usize) -> Result<()> {
        while self.buf.len() < need && self.unread > 0 {
            let room = self.buf.accounted_capacity().saturating_sub(self.buf.len()).max(need);
            let chunk = (room as u64).min(self.unread) as usize;
            let start = self.buf.len();
            self.buf.resize(start + chunk, 0);
            self.file.read_exact(&mut self.buf[start..])?;
            self.unread -= chunk as u64;
        }
        if self.buf.len() < need {
            return Err(IndexError::Corrupted(format!(
                "block ended early: need {} bytes, have {}",
                need,
                self.buf.len()
            )));
        }
        Ok(())
    }
}

impl<L: Layout> MergeSource<L::Key> for BlockReader<L> {
    fn peek(&self) -> Option<&L::Key> {
        self.has_current.then_some(&self.current)
    }

    fn advance(&mut self) -> Result<()> {
        if self.entries_left == 0 {
            self.has_current = false;
            return Ok(());
        }
        self.fill(ENTRY_LEN_SIZE)?;
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        self.fill(ENTRY_LEN_SIZE + len)?;
        let mut cursor: &[u8] = &self.buf[ENTRY_LEN_SIZE..ENTRY_LEN_SIZE + len];
        self.layout.read_key(&mut cursor, &mut self.current)?;
        self.buf.advance(ENTRY_LEN_SIZE + len);
        self.entries_left -= 1;
        self.has_current = true;
        Ok(())
    }
}

/// Ascending cursor over every entry of a block store.
pub struct BlockStoreReader<L: Layout> {
    merge: KWayMerge<L, BlockReader<L>>,
    current: L::Key,
    has_current: bool,
}

impl<L: Layout> BlockStoreReader<L> {
    pub(crate) fn new(layout: Arc<L>, blocks: Vec<BlockReader<L>>) -> Result<Self> {
        let current = layout.new_key();
        let mut reader = Self {
            merge: KWayMerge::new(layout, blocks),
            current,
            has_current: false,
        };
        reader.advance()?;
        Ok(reader)
    }

    /// Writes the next entry into `into`. Returns false at the end.
    pub fn next_into(&mut self, into: &mut L::Key) -> Result<bool> {
        if !self.has_current {
            return Ok(false);
        }
        into.clone_from(&self.current);
        self.advance()?;
        Ok(true)
    }
}

impl<L: Layout> MergeSource<L::Key> for BlockStoreReader<L> {
    fn peek(&self) -> Option<&L::Key> {
        self.has_current.then_some(&self.current)
    }

    fn advance(&mut self) -> Result<()> {
        self.has_current = self.merge.next_into(&mut self.current)?;
        Ok(())
    }
}
