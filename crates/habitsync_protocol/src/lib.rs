//! # habitsync protocol
//!
//! Types shared by the local store and the sync engine.
//!
//! This crate provides:
//! - The cached entities ([`Habit`], [`Completion`], [`StepRecord`],
//!   [`Badge`], [`UserBadge`]) and their natural keys
//! - [`SyncStatus`], the per-row sync tag
//! - [`QueuedMutation`], the typed payload of a sync queue item
//! - The conflict resolver: pure, deterministic merge policies per entity type
//!
//! Nothing here performs I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod mutation;

pub use conflict::{
    merge_completions, merge_step_records, resolve_completion, resolve_habit,
    resolve_step_record,
};
pub use entity::{
    Badge, Completion, CompletionKey, EntityType, Habit, Operation, StepKey, StepRecord,
    SyncStatus, UserBadge,
};
pub use mutation::QueuedMutation;
