//! CLI command implementations.

pub mod compact;
pub mod dump_log;
pub mod inspect;
pub mod migrate;
pub mod queue;
pub mod verify;

use habitsync_store::{LocalStore, StoreConfig};
use std::path::Path;

/// Opens an existing store without applying migrations.
pub fn open_existing(path: &Path) -> Result<LocalStore, Box<dyn std::error::Error>> {
    let config = StoreConfig::default()
        .create_if_missing(false)
        .run_migrations(false);
    Ok(LocalStore::open_with_config(path, config)?)
}

/// Reads the whole log file of a store directory without taking its lock.
pub fn read_log(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    use habitsync_storage::{FileBackend, StorageBackend};

    let log_path = habitsync_store::StoreDir::log_path_in(path);
    if !log_path.exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    let backend = FileBackend::open(&log_path)?;
    Ok(backend.read_all()?)
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_existing_does_not_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(open_existing(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn read_log_requires_a_store() {
        let dir = tempdir().unwrap();
        assert!(read_log(dir.path()).is_err());
    }

    #[test]
    fn committed_records_verify() {
        let dir = tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store.set_meta("device", "phone").unwrap();
        }
        let data = read_log(dir.path()).unwrap();
        let result = verify::verify_log(&data);
        assert!(result.is_ok());
        assert!(result.valid_records >= 2);
        assert_eq!(result.valid_len, data.len() as u64);
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }
}
