//! Page-level file I/O for index files.

use nidx_common::{IndexError, PageNum, Result, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Reads and writes fixed-size pages of one index file.
pub(crate) struct PageFile {
    path: PathBuf,
    fsync_enabled: bool,
    handle: Mutex<FileHandle>,
}

struct FileHandle {
    file: File,
    num_pages: u32,
}

impl PageFile {
    /// Creates the file, discarding any previous content.
    pub fn create(path: &Path, fsync_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            fsync_enabled,
            handle: Mutex::new(FileHandle { file, num_pages: 0 }),
        })
    }

    /// Opens an existing file.
    pub fn open(path: &Path, fsync_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();
        if file_size % PAGE_SIZE as u64 != 0 {
            return Err(IndexError::Corrupted(format!(
                "{} has a partial page ({} bytes)",
                path.display(),
                file_size
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            fsync_enabled,
            handle: Mutex::new(FileHandle {
                file,
                num_pages: (file_size / PAGE_SIZE as u64) as u32,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_pages(&self) -> u32 {
        self.handle.lock().num_pages
    }

    /// Reads a page.
    pub fn read_page(&self, page_num: PageNum) -> Result<Box<[u8; PAGE_SIZE]>> {
        let mut handle = self.handle.lock();
        if page_num >= handle.num_pages {
            return Err(IndexError::Corrupted(format!(
                "page {} does not exist in {}",
                page_num,
                self.path.display()
            )));
        }
        let offset = (page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = Box::new([0u8; PAGE_SIZE]);
        handle.file.read_exact(&mut buffer[..])?;
        Ok(buffer)
    }

    /// Writes a page, extending the file if needed.
    pub fn write_page(&self, page_num: PageNum, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut handle = self.handle.lock();
        let offset = (page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        if page_num >= handle.num_pages {
            handle.num_pages = page_num + 1;
        }
        Ok(())
    }

    /// Drops every page from `num_pages` on.
    pub fn truncate(&self, num_pages: u32) -> Result<()> {
        let mut handle = self.handle.lock();
        if num_pages < handle.num_pages {
            handle.file.set_len(num_pages as u64 * PAGE_SIZE as u64)?;
            handle.num_pages = num_pages;
        }
        Ok(())
    }

    /// Flushes pending writes, syncing to disk when enabled.
    pub fn flush(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        handle.file.flush()?;
        if self.fsync_enabled {
            handle.file.sync_all()?;
        }
        Ok(())
    }
}
