//! File naming for one index.
//!
//! ```text
//! <dir>/<name>.idx          index tree
//! <dir>/<name>.idx.dup      recorded uniqueness conflicts
//! <dir>/<name>.ext          external updates received during population
//! <dir>/<name>.scan-<n>     scan entries of worker n
//! <dir>/<name>.parts/<n>/   files of partition n in a partitioned population
//! ```

use nidx_common::Result;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Locates every file belonging to one index.
#[derive(Debug, Clone)]
pub struct IndexFiles {
    dir: PathBuf,
    name: String,
}

impl IndexFiles {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.name, suffix))
    }

    pub fn store_file(&self) -> PathBuf {
        self.file(".idx")
    }

    pub fn duplicates_file(&self) -> PathBuf {
        self.file(".idx.dup")
    }

    pub fn external_updates_file(&self) -> PathBuf {
        self.file(".ext")
    }

    pub fn scan_file(&self, worker: usize) -> PathBuf {
        self.file(&format!(".scan-{}", worker))
    }

    pub fn parts_dir(&self) -> PathBuf {
        self.file(".parts")
    }

    /// Files of partition `part`, named like the parent index.
    pub fn part(&self, part: usize) -> IndexFiles {
        IndexFiles::new(self.parts_dir().join(part.to_string()), self.name.clone())
    }

    pub fn exists(&self) -> bool {
        self.store_file().exists()
    }

    /// Creates the directory if missing.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Removes stale files from an earlier population attempt.
    pub fn clear(&self) -> Result<()> {
        self.delete_all()?;
        self.ensure_dir()
    }

    /// Removes every file of this index, ignoring files that do not exist.
    pub fn delete_all(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !self.owns(file_name) {
                continue;
            }
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn owns(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(self.name.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        let files = IndexFiles::new("/data/index", "people");
        assert_eq!(files.store_file(), PathBuf::from("/data/index/people.idx"));
        assert_eq!(
            files.duplicates_file(),
            PathBuf::from("/data/index/people.idx.dup")
        );
        assert_eq!(
            files.external_updates_file(),
            PathBuf::from("/data/index/people.ext")
        );
        assert_eq!(files.scan_file(3), PathBuf::from("/data/index/people.scan-3"));
        assert_eq!(
            files.part(2).store_file(),
            PathBuf::from("/data/index/people.parts/2/people.idx")
        );
    }

    #[test]
    fn test_delete_all_keeps_other_indexes() {
        let dir = tempdir().unwrap();
        let files = IndexFiles::new(dir.path(), "people");
        files.clear().unwrap();
        fs::write(files.store_file(), b"x").unwrap();
        fs::write(files.scan_file(0), b"x").unwrap();
        fs::create_dir_all(files.part(0).dir()).unwrap();
        fs::write(files.part(0).store_file(), b"x").unwrap();
        let other = IndexFiles::new(dir.path(), "peoplex");
        fs::write(other.store_file(), b"x").unwrap();

        files.delete_all().unwrap();
        assert!(!files.exists());
        assert!(!files.scan_file(0).exists());
        assert!(!files.parts_dir().exists());
        assert!(other.exists());
    }

    #[test]
    fn test_delete_all_missing_dir() {
        let dir = tempdir().unwrap();
        let files = IndexFiles::new(dir.path().join("missing"), "people");
        assert!(files.delete_all().is_ok());
    }
}
