//! # habitsync storage
//!
//! Byte-level backends underneath the habitsync local store.
//!
//! A backend is an **opaque, append-only byte store**. It knows nothing about
//! log records, tables or sync state; the store crate owns the record format
//! and replays it on open.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests
//! - [`FileBackend`] - the on-device log file
//! - [`FaultyBackend`] - wraps another backend and fails writes on demand,
//!   used to exercise local persistence failures
//!
//! ## Example
//!
//! ```rust
//! use habitsync_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"batch").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"batch");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod faulty;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use faulty::{FaultSwitch, FaultyBackend};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
