//! Cached rows and their sync metadata.

use chrono::{DateTime, Utc};
use habitsync_protocol::SyncStatus;
use serde::{Deserialize, Serialize};

/// A locally cached entity plus its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row<T> {
    /// The entity.
    pub data: T,
    /// Where the row stands relative to the remote.
    pub sync_status: SyncStatus,
    /// Last time the remote confirmed this row. `None` means the remote has
    /// never seen it.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Locally deleted, remote deletion not confirmed yet.
    pub deleted: bool,
    /// Message of the last failed push.
    pub error_message: Option<String>,
}

impl<T> Row<T> {
    /// A row carrying an unconfirmed local mutation.
    pub fn pending(data: T) -> Self {
        Self {
            data,
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
            deleted: false,
            error_message: None,
        }
    }

    /// A row matching the remote as of `at`.
    pub fn synced(data: T, at: DateTime<Utc>) -> Self {
        Self {
            data,
            sync_status: SyncStatus::Synced,
            last_synced_at: Some(at),
            deleted: false,
            error_message: None,
        }
    }

    /// Returns true unless the row is a pending deletion.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    /// Returns true if the remote has confirmed this row at least once.
    #[must_use]
    pub fn known_remotely(&self) -> bool {
        self.last_synced_at.is_some()
    }

    /// Returns true if the push phase has work for this row.
    #[must_use]
    pub fn needs_push(&self) -> bool {
        self.deleted || self.sync_status.needs_push()
    }
}
