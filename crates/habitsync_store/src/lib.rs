//! # habitsync store
//!
//! Durable on-device cache for the habitsync client.
//!
//! This crate provides:
//! - [`LocalStore`]: one table per entity type, each row tagged with its sync
//!   status, all writes committed atomically through an append-only log
//! - [`SyncQueue`]: the durable retry queue of remote mutations, with
//!   backoff and dead-lettering
//! - Schema migrations ([`Migration`], [`MigrationManager`])
//! - Log maintenance: replay with torn-tail recovery, compaction, stats
//!
//! The store is synchronous; callers on an async runtime keep transactions
//! short and never hold one across an `.await`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dir;
mod error;
pub mod meta;
mod migration;
mod queue;
mod record;
mod row;
mod store;
mod tables;
mod transaction;

pub use config::{RetryPolicy, StoreConfig};
pub use dir::StoreDir;
pub use error::{StoreError, StoreResult};
pub use migration::{
    InitialSchema, Migration, MigrationManager, MigrationVersion, PruneOrphanCompletions,
    LATEST_SCHEMA_VERSION,
};
pub use queue::{QueueItem, SyncQueue};
pub use record::{LogReader, LogRecord, RecordKind, LOG_MAGIC, LOG_VERSION};
pub use row::Row;
pub use store::{CompactStats, LocalStore, QueueStats, StoreStats, TableStats};
pub use tables::{Entity, Mutation, Tables};
pub use transaction::Transaction;
