//! Bounded in-memory buffering with sorted spill blocks.

use super::merge::KWayMerge;
use super::reader::{BlockReader, BlockStoreReader};
use crate::cancel::Cancellation;
use crate::layout::Layout;
use bytes::BufMut;
use nidx_buffer::{BufferArena, ScopedBuffer};
use nidx_common::{IndexError, PopulationConfig, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Block header: entry count and payload byte length, both u64.
pub(crate) const BLOCK_HEADER_SIZE: usize = 16;

/// Length prefix in front of every serialized key.
pub(crate) const ENTRY_LEN_SIZE: usize = 4;

/// Entries between cancellation checks while merging.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Location of one spilled block in the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockInfo {
    pub offset: u64,
    pub entry_count: u64,
    pub byte_len: u64,
}

/// Collects keys in memory and spills them as sorted blocks to one file.
///
/// Keys are buffered until a block's worth of bytes is reached, then
/// sorted and appended to the store file. Both the write buffer and the
/// file are created on the first spill. Once `done_adding` is called the
/// entry count is fixed and `reader` yields every key in ascending order.
/// Closing, or dropping, the store deletes its file.
pub struct BlockStore<L: Layout> {
    layout: Arc<L>,
    arena: Arc<BufferArena>,
    path: PathBuf,
    block_size: usize,
    read_buffer_size: usize,
    fsync_enabled: bool,
    pending: Vec<L::Key>,
    pending_bytes: usize,
    write_buffer: Option<ScopedBuffer>,
    file: Option<File>,
    file_len: u64,
    blocks: Vec<BlockInfo>,
    entry_count: u64,
    done_adding: bool,
    closed: bool,
}

impl<L: Layout> BlockStore<L> {
    /// Creates an empty store spilling to `path`. Nothing is allocated yet.
    pub fn new(
        layout: Arc<L>,
        arena: Arc<BufferArena>,
        path: impl Into<PathBuf>,
        config: &PopulationConfig,
    ) -> Self {
        Self {
            layout,
            arena,
            path: path.into(),
            block_size: config.block_size,
            read_buffer_size: config.read_buffer_size,
            fsync_enabled: config.fsync_enabled,
            pending: Vec::new(),
            pending_bytes: 0,
            write_buffer: None,
            file: None,
            file_len: 0,
            blocks: Vec::new(),
            entry_count: 0,
            done_adding: false,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of keys added so far. Stable once `done_adding` ran.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Number of blocks spilled to the file.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_done_adding(&self) -> bool {
        self.done_adding
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once the backing file exists.
    pub fn has_file(&self) -> bool {
        self.file.is_some() || self.path.exists()
    }

    /// Largest key this store accepts.
    pub fn max_key_size(&self) -> usize {
        self.block_size - BLOCK_HEADER_SIZE - ENTRY_LEN_SIZE
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(IndexError::invalid_state(format!(
                "block store {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Buffers a key, spilling a sorted block first if it would not fit.
    pub fn add(&mut self, key: &L::Key) -> Result<()> {
        self.check_open()?;
        if self.done_adding {
            return Err(IndexError::invalid_state(
                "cannot add to a block store after done_adding",
            ));
        }
        let size = self.layout.key_size(key);
        if size > self.max_key_size() {
            return Err(IndexError::OversizedEntry {
                size,
                max: self.max_key_size(),
            });
        }
        let framed = ENTRY_LEN_SIZE + size;
        if self.pending_bytes + framed > self.block_size - BLOCK_HEADER_SIZE {
            self.spill()?;
        }
        self.pending.push(key.clone());
        self.pending_bytes += framed;
        self.entry_count += 1;
        Ok(())
    }

    fn open_file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?;
            self.file = Some(file);
            self.file_len = 0;
        }
        self.file
            .as_mut()
            .ok_or_else(|| IndexError::Internal("block store file missing".to_string()))
    }

    /// Sorts the pending keys and appends them as one block.
    fn spill(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.write_buffer.is_none() {
            self.write_buffer = Some(self.arena.allocate(self.block_size)?);
        }

        let layout = Arc::clone(&self.layout);
        self.pending.sort_by(|a, b| layout.compare(a, b));

        let offset = self.file_len;
        let entry_count = self.pending.len() as u64;
        let byte_len = self.pending_bytes as u64;
        let mut buffer = self
            .write_buffer
            .take()
            .ok_or_else(|| IndexError::Internal("block write buffer missing".to_string()))?;
        buffer.clear();
        buffer.put_u64_le(entry_count);
        buffer.put_u64_le(byte_len);
        for key in &self.pending {
            buffer.put_u32_le(layout.key_size(key) as u32);
            layout.write_key(key, &mut *buffer);
        }

        let written = self.open_file().and_then(|file| {
            file.write_all(&buffer)?;
            Ok(())
        });
        let block_bytes = buffer.len() as u64;
        self.write_buffer = Some(buffer);
        written?;

        self.file_len += block_bytes;
        self.blocks.push(BlockInfo {
            offset,
            entry_count,
            byte_len,
        });
        self.pending.clear();
        self.pending_bytes = 0;

        debug!(
            path = %self.path.display(),
            block = self.blocks.len() - 1,
            entries = entry_count,
            bytes = block_bytes,
            "spilled sorted block"
        );
        Ok(())
    }

    /// Spills the remaining keys and freezes the store.
    pub fn done_adding(&mut self) -> Result<()> {
        self.check_open()?;
        if self.done_adding {
            return Ok(());
        }
        self.spill()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            if self.fsync_enabled {
                file.sync_all()?;
            }
        }
        self.write_buffer = None;
        self.done_adding = true;
        Ok(())
    }

    /// Opens an ascending cursor over every key.
    ///
    /// Fails with `InvalidState` before `done_adding`.
    pub fn reader(&self) -> Result<BlockStoreReader<L>> {
        self.check_open()?;
        if !self.done_adding {
            return Err(IndexError::invalid_state(
                "block store reader requested before done_adding",
            ));
        }
        let readers = self
            .blocks
            .iter()
            .map(|block| {
                BlockReader::open(
                    Arc::clone(&self.layout),
                    &self.arena,
                    &self.path,
                    block,
                    self.read_buffer_size,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        BlockStoreReader::new(Arc::clone(&self.layout), readers)
    }

    fn merge_target(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".merging");
        self.path.with_file_name(name)
    }

    /// Merges blocks in passes until at most `merge_factor` remain.
    ///
    /// Each pass merges groups of `merge_factor` blocks into a sibling
    /// file that then replaces the store file.
    pub fn merge(&mut self, merge_factor: usize, cancel: &Cancellation) -> Result<()> {
        self.check_open()?;
        if !self.done_adding {
            return Err(IndexError::invalid_state(
                "block store merge requested before done_adding",
            ));
        }
        let merge_factor = merge_factor.max(2);
        let mut pass = 0;
        while self.blocks.len() > merge_factor {
            cancel.check()?;
            let target = self.merge_target();
            let result = self.merge_pass(&target, merge_factor, cancel);
            let blocks = match result {
                Ok(blocks) => blocks,
                Err(e) => {
                    let _ = fs::remove_file(&target);
                    return Err(e);
                }
            };
            self.file = None;
            fs::rename(&target, &self.path)?;
            let before = self.blocks.len();
            self.file_len = blocks
                .last()
                .map_or(0, |b| b.offset + BLOCK_HEADER_SIZE as u64 + b.byte_len);
            self.blocks = blocks;
            pass += 1;
            debug!(
                path = %self.path.display(),
                pass,
                blocks_before = before,
                blocks_after = self.blocks.len(),
                "merged block pass"
            );
        }
        Ok(())
    }

    fn merge_pass(
        &self,
        target: &Path,
        merge_factor: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<BlockInfo>> {
        let out = File::create(target)?;
        let mut writer = BufWriter::with_capacity(self.read_buffer_size, out);
        let mut merged = Vec::with_capacity(self.blocks.len().div_ceil(merge_factor));
        let mut offset = 0u64;
        let mut key = self.layout.new_key();
        let mut scratch = Vec::new();

        for group in self.blocks.chunks(merge_factor) {
            let entry_count: u64 = group.iter().map(|b| b.entry_count).sum();
            let byte_len: u64 = group.iter().map(|b| b.byte_len).sum();
            writer.write_all(&entry_count.to_le_bytes())?;
            writer.write_all(&byte_len.to_le_bytes())?;

            let readers = group
                .iter()
                .map(|block| {
                    BlockReader::open(
                        Arc::clone(&self.layout),
                        &self.arena,
                        &self.path,
                        block,
                        self.read_buffer_size,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            let mut merge = KWayMerge::new(Arc::clone(&self.layout), readers);
            let mut written = 0u64;
            while merge.next_into(&mut key)? {
                if written % CANCEL_CHECK_INTERVAL == 0 {
                    cancel.check()?;
                }
                scratch.clear();
                self.layout.write_key(&key, &mut scratch);
                writer.write_all(&(scratch.len() as u32).to_le_bytes())?;
                writer.write_all(&scratch)?;
                written += 1;
            }
            if written != entry_count {
                return Err(IndexError::Corrupted(format!(
                    "merged {} entries, expected {}",
                    written, entry_count
                )));
            }
            merged.push(BlockInfo {
                offset,
                entry_count,
                byte_len,
            });
            offset += BLOCK_HEADER_SIZE as u64 + byte_len;
        }

        let file = writer.into_inner().map_err(|e| IndexError::Io(e.into_error()))?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(merged)
    }

    /// Releases buffers and deletes the backing file. Safe to call twice.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending = Vec::new();
        self.pending_bytes = 0;
        self.write_buffer = None;
        self.file = None;
        self.blocks.clear();

        let target = self.merge_target();
        if target.exists() {
            fs::remove_file(&target)?;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<L: Layout> Drop for BlockStore<L> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to remove block store file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MergeSource;
    use crate::key::IndexKey;
    use crate::layout::GenericLayout;
    use nidx_common::{ArenaConfig, Value};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn create_test_store(dir: &Path, block_size: usize) -> BlockStore<GenericLayout> {
        let config = PopulationConfig {
            block_size,
            read_buffer_size: 256,
            ..PopulationConfig::default()
        };
        BlockStore::new(
            Arc::new(GenericLayout::new(1)),
            Arc::new(BufferArena::unbounded()),
            dir.join("test.scan"),
            &config,
        )
    }

    fn int_key(entity: i64, value: i64) -> IndexKey {
        GenericLayout::new(1)
            .key_of(entity, &[Value::Int(value)])
            .unwrap()
    }

    fn read_all(store: &BlockStore<GenericLayout>) -> Vec<i64> {
        let mut reader = store.reader().unwrap();
        let mut key = IndexKey::new(1);
        let mut out = Vec::new();
        while reader.next_into(&mut key).unwrap() {
            out.push(key.entity_id());
        }
        out
    }

    #[test]
    fn test_file_created_lazily_and_deleted_on_close() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        assert!(!store.has_file());

        store.add(&int_key(1, 1)).unwrap();
        assert!(!store.has_file());

        store.done_adding().unwrap();
        assert!(store.has_file());
        assert_eq!(read_all(&store), vec![1]);

        store.close().unwrap();
        assert!(!dir.path().join("test.scan").exists());
        store.close().unwrap();
    }

    #[test]
    fn test_close_without_done_adding_deletes_file() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        for i in 0..2000 {
            store.add(&int_key(i, i)).unwrap();
        }
        assert!(store.block_count() > 0);
        assert!(store.has_file());

        store.close().unwrap();
        assert!(!dir.path().join("test.scan").exists());
    }

    #[test]
    fn test_drop_deletes_file() {
        let dir = tempdir().unwrap();
        {
            let mut store = create_test_store(dir.path(), 4096);
            store.add(&int_key(1, 1)).unwrap();
            store.done_adding().unwrap();
            assert!(dir.path().join("test.scan").exists());
        }
        assert!(!dir.path().join("test.scan").exists());
    }

    #[test]
    fn test_reader_before_done_adding_is_invalid_state() {
        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path(), 4096);
        assert!(matches!(store.reader(), Err(IndexError::InvalidState(_))));
    }

    #[test]
    fn test_add_after_done_adding_is_invalid_state() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        store.done_adding().unwrap();
        assert!(matches!(
            store.add(&int_key(1, 1)),
            Err(IndexError::InvalidState(_))
        ));
        assert_eq!(read_all(&store), Vec::<i64>::new());
        assert!(!store.has_file());
    }

    #[test]
    fn test_spilled_blocks_read_back_sorted() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        let mut values: Vec<i64> = (0..5000).collect();
        values.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for v in &values {
            store.add(&int_key(*v, *v)).unwrap();
        }
        store.done_adding().unwrap();
        assert!(store.block_count() > 8);
        assert_eq!(store.entry_count(), 5000);
        assert_eq!(read_all(&store), (0..5000).collect::<Vec<_>>());
    }

    #[test]
    fn test_multi_pass_merge() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        let mut values: Vec<i64> = (0..6000).collect();
        values.shuffle(&mut rand::rngs::StdRng::seed_from_u64(11));
        for v in &values {
            store.add(&int_key(*v, *v / 3)).unwrap();
        }
        store.done_adding().unwrap();
        let blocks_before = store.block_count();
        assert!(blocks_before > 9);

        store.merge(3, &Cancellation::new()).unwrap();
        assert!(store.block_count() <= 3);
        assert_eq!(store.entry_count(), 6000);
        assert_eq!(read_all(&store), (0..6000).collect::<Vec<_>>());
        assert!(!store.merge_target().exists());
    }

    #[test]
    fn test_cancelled_merge_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        for v in 0..3000 {
            store.add(&int_key(v, -v)).unwrap();
        }
        store.done_adding().unwrap();
        let cancel = Cancellation::new();
        cancel.cancel();
        assert!(matches!(store.merge(2, &cancel), Err(IndexError::Cancelled)));
        assert!(!store.merge_target().exists());
        store.close().unwrap();
    }

    #[test]
    fn test_oversized_key_rejected() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        let layout = GenericLayout::new(1);
        let big = layout
            .key_of(1, &[Value::text("x".repeat(5000))])
            .unwrap();
        assert!(matches!(
            store.add(&big),
            Err(IndexError::OversizedEntry { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_key_wider_than_u16_roundtrips() {
        let dir = tempdir().unwrap();
        let config = PopulationConfig {
            block_size: 256 * 1024,
            ..PopulationConfig::default()
        };
        let layout = Arc::new(GenericLayout::new(2));
        let mut store = BlockStore::new(
            Arc::clone(&layout),
            Arc::new(BufferArena::unbounded()),
            dir.path().join("wide.scan"),
            &config,
        );
        let wide = |entity: i64, fill: &str| {
            let text = Value::text(fill.repeat(40_000));
            layout.key_of(entity, &[text.clone(), text]).unwrap()
        };
        store.add(&wide(2, "b")).unwrap();
        store.add(&wide(1, "a")).unwrap();
        store.done_adding().unwrap();

        let mut reader = store.reader().unwrap();
        let mut key = layout.new_key();
        assert!(reader.next_into(&mut key).unwrap());
        assert_eq!(key.entity_id(), 1);
        assert!(key.exact_value_eq(&wide(1, "a")));
        assert!(reader.next_into(&mut key).unwrap());
        assert_eq!(key.entity_id(), 2);
        assert!(!reader.next_into(&mut key).unwrap());
        store.close().unwrap();
    }

    #[test]
    fn test_reader_as_merge_source() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path(), 4096);
        store.add(&int_key(2, 20)).unwrap();
        store.add(&int_key(1, 10)).unwrap();
        store.done_adding().unwrap();

        let mut reader = store.reader().unwrap();
        assert_eq!(reader.peek().map(|k| k.entity_id()), Some(1));
        reader.advance().unwrap();
        assert_eq!(reader.peek().map(|k| k.entity_id()), Some(2));
        reader.advance().unwrap();
        assert!(reader.peek().is_none());
    }

    #[test]
    fn test_arena_bounds_write_buffer() {
        let dir = tempdir().unwrap();
        let config = PopulationConfig {
            block_size: 8192,
            ..PopulationConfig::default()
        };
        let arena = Arc::new(BufferArena::new(ArenaConfig {
            max_bytes: Some(4096),
            ..ArenaConfig::default()
        }));
        let mut store = BlockStore::new(
            Arc::new(GenericLayout::new(1)),
            Arc::clone(&arena),
            dir.path().join("bounded.scan"),
            &config,
        );
        store.add(&int_key(1, 1)).unwrap();
        assert!(matches!(
            store.done_adding(),
            Err(IndexError::ArenaExhausted { .. })
        ));
        store.close().unwrap();
        assert_eq!(arena.used_bytes(), 0);
    }
}
