//! Side log of external updates received while a population runs.
//!
//! Records are appended in arrival order to a single file and replayed
//! once, in the same order, after the scanned entries are in the tree.

mod record;

pub use record::{decode_record, encode_record, UpdateRecord};

use bytes::BytesMut;
use nidx_common::{IndexError, Result};
use nidx_storage::Layout;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bytes buffered in memory before they are written to the log file.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Append-only log of external updates.
///
/// The file is created on the first flush and deleted on `close`.
pub struct UpdateLog<L: Layout> {
    layout: Arc<L>,
    path: PathBuf,
    fsync_enabled: bool,
    buffer: BytesMut,
    file: Option<File>,
    count: u64,
    done_adding: bool,
    closed: bool,
}

impl<L: Layout> UpdateLog<L> {
    pub fn new(layout: Arc<L>, path: impl Into<PathBuf>, fsync_enabled: bool) -> Self {
        Self {
            layout,
            path: path.into(),
            fsync_enabled,
            buffer: BytesMut::new(),
            file: None,
            count: 0,
            done_adding: false,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records appended.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_done_adding(&self) -> bool {
        self.done_adding
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(IndexError::invalid_state("update log is closed"));
        }
        Ok(())
    }

    /// Appends one record.
    pub fn add(&mut self, record: &UpdateRecord<L::Key>) -> Result<()> {
        self.check_open()?;
        if self.done_adding {
            return Err(IndexError::invalid_state(
                "update log no longer accepts records",
            ));
        }
        encode_record(self.layout.as_ref(), record, &mut self.buffer);
        self.count += 1;
        if self.buffer.len() >= WRITE_BUFFER_SIZE {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        if let Some(file) = &mut self.file {
            file.write_all(&self.buffer)?;
        }
        self.buffer.clear();
        Ok(())
    }

    /// Writes out buffered records. No records may be added afterwards.
    pub fn done_adding(&mut self) -> Result<()> {
        self.check_open()?;
        if self.done_adding {
            return Ok(());
        }
        self.flush_buffer()?;
        if let Some(file) = &mut self.file {
            file.flush()?;
            if self.fsync_enabled {
                file.sync_all()?;
            }
        }
        self.file = None;
        self.buffer = BytesMut::new();
        self.done_adding = true;
        debug!(path = %self.path.display(), records = self.count, "external update log sealed");
        Ok(())
    }

    /// Opens a cursor over every record in arrival order.
    pub fn reader(&self) -> Result<UpdateLogReader<L>> {
        self.check_open()?;
        if !self.done_adding {
            return Err(IndexError::invalid_state(
                "update log reader requested before done_adding",
            ));
        }
        let input = if self.count == 0 {
            None
        } else {
            Some(BufReader::new(File::open(&self.path)?))
        };
        Ok(UpdateLogReader {
            layout: Arc::clone(&self.layout),
            input,
            remaining: self.count,
            body: Vec::new(),
        })
    }

    /// Deletes the log file. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.file = None;
        self.buffer = BytesMut::new();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<L: Layout> Drop for UpdateLog<L> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to delete update log");
        }
    }
}

/// Forward cursor over an update log.
pub struct UpdateLogReader<L: Layout> {
    layout: Arc<L>,
    input: Option<BufReader<File>>,
    remaining: u64,
    body: Vec<u8>,
}

impl<L: Layout> UpdateLogReader<L> {
    /// Reads the next record, or `None` at the end of the log.
    pub fn next_record(&mut self) -> Result<Option<UpdateRecord<L::Key>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let Some(input) = &mut self.input else {
            return Ok(None);
        };
        let mut word = [0u8; 4];
        read_exact(input, &mut word)?;
        let len = u32::from_le_bytes(word) as usize;
        self.body.resize(len, 0);
        read_exact(input, &mut self.body)?;
        read_exact(input, &mut word)?;
        let record = decode_record(self.layout.as_ref(), &self.body, u32::from_le_bytes(word))?;
        self.remaining -= 1;
        Ok(Some(record))
    }
}

fn read_exact(input: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            IndexError::Corrupted("update log ends inside a record".to_string())
        } else {
            IndexError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::UpdateMode;
    use nidx_common::Value;
    use nidx_storage::GenericLayout;
    use tempfile::tempdir;

    #[test]
    fn test_replay_in_arrival_order() {
        let dir = tempdir().unwrap();
        let layout = Arc::new(GenericLayout::new(1));
        let mut log = UpdateLog::new(Arc::clone(&layout), dir.path().join("i.ext"), false);

        let n = 5000;
        for i in 0..n {
            let key = layout.key_of(i, &[Value::Int(n - i)]).unwrap();
            let record = if i % 2 == 0 {
                UpdateRecord::added(key)
            } else {
                UpdateRecord::removed(key)
            };
            log.add(&record).unwrap();
        }
        log.done_adding().unwrap();
        assert_eq!(log.count(), n as u64);

        let mut reader = log.reader().unwrap();
        let mut seen = 0;
        while let Some(record) = reader.next_record().unwrap() {
            assert_eq!(layout.entity_id(&record.key), seen);
            let expected = if seen % 2 == 0 {
                UpdateMode::Added
            } else {
                UpdateMode::Removed
            };
            assert_eq!(record.mode, expected);
            seen += 1;
        }
        assert_eq!(seen, n);
    }

    #[test]
    fn test_empty_log_creates_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i.ext");
        let mut log = UpdateLog::new(Arc::new(GenericLayout::new(1)), &path, false);
        log.done_adding().unwrap();
        assert!(!path.exists());
        assert!(log.reader().unwrap().next_record().unwrap().is_none());
    }

    #[test]
    fn test_lifecycle_errors_and_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i.ext");
        let layout = Arc::new(GenericLayout::new(1));
        let mut log = UpdateLog::new(Arc::clone(&layout), &path, false);
        let key = layout.key_of(1, &[Value::text("a")]).unwrap();
        log.add(&UpdateRecord::added(key.clone())).unwrap();
        assert!(matches!(log.reader(), Err(IndexError::InvalidState(_))));

        log.done_adding().unwrap();
        assert!(path.exists());
        assert!(log.add(&UpdateRecord::added(key)).is_err());

        log.close().unwrap();
        log.close().unwrap();
        assert!(!path.exists());
        assert!(log.reader().is_err());
    }

    #[test]
    fn test_truncated_log_is_corrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i.ext");
        let layout = Arc::new(GenericLayout::new(1));
        let mut log = UpdateLog::new(Arc::clone(&layout), &path, false);
        log.add(&UpdateRecord::added(layout.key_of(1, &[Value::Int(1)]).unwrap()))
            .unwrap();
        log.done_adding().unwrap();

        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let mut reader = log.reader().unwrap();
        assert!(matches!(reader.next_record(), Err(IndexError::Corrupted(_))));
    }
}
