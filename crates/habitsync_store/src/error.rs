//! Error types for the local store.

use habitsync_protocol::EntityType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] habitsync_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The log contains an invalid record.
    #[error("log corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the bad record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A record's checksum does not match its content.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the bad record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The store directory does not exist and creation was disabled.
    #[error("no store at {0}")]
    Missing(PathBuf),

    /// No live row with this key.
    #[error("{entity_type} row not found: {key}")]
    NotFound {
        /// Table searched.
        entity_type: EntityType,
        /// Rendered key.
        key: String,
    },

    /// A live row with this key already exists.
    #[error("{entity_type} row already exists: {key}")]
    AlreadyExists {
        /// Table written.
        entity_type: EntityType,
        /// Rendered key.
        key: String,
    },

    /// No queue item with this id.
    #[error("sync queue item not found: {0}")]
    QueueItemNotFound(u64),

    /// The store was written by a newer schema than this build knows.
    #[error("store schema v{found} is newer than supported v{supported}")]
    IncompatibleSchema {
        /// Version recorded in the store.
        found: u64,
        /// Latest version this build knows.
        supported: u64,
    },

    /// A schema migration failed; its transaction was rolled back.
    #[error("migration v{version} failed: {message}")]
    MigrationFailed {
        /// Migration version.
        version: u64,
        /// Underlying failure.
        message: String,
    },

    /// Caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(entity_type: EntityType, key: impl ToString) -> Self {
        Self::NotFound {
            entity_type,
            key: key.to_string(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(entity_type: EntityType, key: impl ToString) -> Self {
        Self::AlreadyExists {
            entity_type,
            key: key.to_string(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl ToString) -> Self {
        Self::Codec(message.to_string())
    }
}
