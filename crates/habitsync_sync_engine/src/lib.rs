//! # habitsync sync engine
//!
//! Keeps the on-device [`LocalStore`](habitsync_store::LocalStore) and the
//! remote system of record converging.
//!
//! This crate provides:
//! - [`SyncOrchestrator`]: single-flight sync passes
//! - [`RemoteService`]: the remote CRUD contract, with [`MemoryRemote`] for tests
//! - [`NetworkMonitor`]: connectivity state and change subscriptions
//! - [`BackgroundSync`]: periodic and reconnection-triggered passes
//!
//! ## Pass order
//!
//! 1. First-run import of the remote snapshot (once per store)
//! 2. Push of every pending row, derived from the store itself
//! 3. Pull and merge of remote state
//! 4. Replay of due sync queue items
//!
//! ## Key Invariants
//!
//! - A pending row is never overwritten by pull before its push is confirmed
//! - A row is marked synced only if it still matches what was pushed
//! - Losing connectivity stops the pass without consuming retry budget
//! - A repeated pass with no changes on either side writes nothing

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod network;
mod orchestrator;
mod phases;
mod remote;
mod scheduler;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use network::{ConnectivityProbe, NetworkMonitor, ProbeError, Subscription};
pub use orchestrator::{PhaseFailure, SyncCounts, SyncOrchestrator, SyncPhase, SyncReport, SyncState};
pub use remote::{
    CompletionFilter, MemoryRemote, RemoteError, RemoteMethod, RemoteResult, RemoteService,
};
pub use scheduler::BackgroundSync;
