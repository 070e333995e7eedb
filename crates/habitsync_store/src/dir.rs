//! Store directory layout and locking.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK        # Advisory lock, one writer process at a time
//! └─ store.log   # Append-only log of committed batches and snapshots
//! ```

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "store.log";

/// An opened store directory holding the exclusive lock.
///
/// The lock is released when this value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens (and optionally creates) a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Missing`] if the directory is absent and
    ///   `create_if_missing` is false
    /// - [`StoreError::Locked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(StoreError::Missing(path.to_path_buf()));
            }
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(StoreError::InvalidArgument(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the log file path.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Returns the log file path for a store directory without opening it.
    #[must_use]
    pub fn log_path_in(path: &Path) -> PathBuf {
        path.join(LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cache");
        let dir = StoreDir::open(&path, true).unwrap();
        assert!(path.join("LOCK").exists());
        assert_eq!(dir.log_path(), path.join("store.log"));
    }

    #[test]
    fn refuses_missing_directory_without_create() {
        let temp = tempdir().unwrap();
        let result = StoreDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(StoreError::Missing(_))));
    }

    #[test]
    fn second_open_is_locked_until_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cache");

        let first = StoreDir::open(&path, true).unwrap();
        assert!(matches!(StoreDir::open(&path, true), Err(StoreError::Locked)));

        drop(first);
        assert!(StoreDir::open(&path, true).is_ok());
    }
}
