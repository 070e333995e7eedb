//! Error types for the sync engine.

use crate::remote::RemoteError;
use habitsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync pass.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote service rejected or failed a call.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A remote call exceeded the request timeout.
    #[error("remote call timed out")]
    Timeout,

    /// The network monitor reports no connectivity.
    #[error("not connected")]
    NotConnected,
}

impl SyncError {
    /// Returns true if retrying later, once connectivity returns, could
    /// succeed without any change on either side.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_connectivity(),
            SyncError::Timeout | SyncError::NotConnected => true,
            SyncError::Store(_) => false,
        }
    }

    /// Returns true if the remote is unreachable altogether. A timeout only
    /// fails the phase it happened in.
    pub fn is_offline(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_connectivity(),
            SyncError::NotConnected => true,
            SyncError::Timeout | SyncError::Store(_) => false,
        }
    }
}
