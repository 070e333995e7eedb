//! Schema migrations.
//!
//! Migrations are:
//! - **Forward-only**: there is no `down`; a store written by a newer build
//!   refuses to open
//! - **Transactional**: each migration and its version bump commit together
//! - **Ordered**: pending migrations run in ascending version order
//!
//! The current version lives in the metadata table under
//! [`meta::SCHEMA_VERSION`]; each applied migration also leaves a
//! `migration.<version>` entry holding its name and apply time.

use crate::error::{StoreError, StoreResult};
use crate::meta;
use crate::store::LocalStore;
use crate::transaction::Transaction;
use habitsync_protocol::{Completion, Habit};
use std::collections::BTreeMap;
use tracing::info;

/// Version number for migrations.
pub type MigrationVersion = u64;

/// Latest schema version this build knows.
pub const LATEST_SCHEMA_VERSION: MigrationVersion = 2;

/// A schema change applied once per store.
pub trait Migration: Send + Sync {
    /// Unique version, starting at 1.
    fn version(&self) -> MigrationVersion;

    /// Short snake_case name.
    fn name(&self) -> &str;

    /// Applies the change.
    fn up(&self, txn: &mut Transaction<'_>) -> StoreResult<()>;
}

/// Registry of migrations.
#[derive(Default)]
pub struct MigrationManager {
    migrations: BTreeMap<MigrationVersion, Box<dyn Migration>>,
}

impl MigrationManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager holding the built-in migrations.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut manager = Self::new();
        manager.register(Box::new(InitialSchema));
        manager.register(Box::new(PruneOrphanCompletions));
        manager
    }

    /// Registers a migration, replacing any with the same version.
    pub fn register(&mut self, migration: Box<dyn Migration>) {
        self.migrations.insert(migration.version(), migration);
    }

    /// Registered `(version, name)` pairs in order.
    pub fn list(&self) -> Vec<(MigrationVersion, String)> {
        self.migrations
            .values()
            .map(|m| (m.version(), m.name().to_string()))
            .collect()
    }

    /// Versions newer than the store's current schema.
    pub fn pending(&self, store: &LocalStore) -> Vec<MigrationVersion> {
        let current = store.schema_version();
        self.migrations.range(current + 1..).map(|(v, _)| *v).collect()
    }

    /// Runs every pending migration. Returns the versions applied.
    ///
    /// # Errors
    ///
    /// [`StoreError::MigrationFailed`] for the first migration that fails;
    /// earlier migrations stay applied.
    pub fn run_pending(&self, store: &LocalStore) -> StoreResult<Vec<MigrationVersion>> {
        let current = store.schema_version();
        let mut applied = Vec::new();

        for (&version, migration) in self.migrations.range(current + 1..) {
            store
                .transaction(|txn| {
                    migration.up(txn)?;
                    txn.set_meta(meta::SCHEMA_VERSION, version.to_string());
                    let record = format!("{} {}", migration.name(), txn.now().to_rfc3339());
                    txn.set_meta(&format!("{}{version}", meta::MIGRATION_PREFIX), record);
                    Ok(())
                })
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    message: e.to_string(),
                })?;
            info!(version, name = migration.name(), "applied migration");
            applied.push(version);
        }

        Ok(applied)
    }
}

/// v1: stamps the creation time of a new store.
pub struct InitialSchema;

impl Migration for InitialSchema {
    fn version(&self) -> MigrationVersion {
        1
    }

    fn name(&self) -> &str {
        "initial_schema"
    }

    fn up(&self, txn: &mut Transaction<'_>) -> StoreResult<()> {
        if txn.get_meta(meta::CREATED_AT).is_none() {
            let now = txn.now().to_rfc3339();
            txn.set_meta(meta::CREATED_AT, now);
        }
        Ok(())
    }
}

/// v2: drops never-synced completions whose habit no longer exists locally.
///
/// Such rows can never be pushed: the remote would reject them for the
/// missing habit.
pub struct PruneOrphanCompletions;

impl Migration for PruneOrphanCompletions {
    fn version(&self) -> MigrationVersion {
        2
    }

    fn name(&self) -> &str {
        "prune_orphan_completions"
    }

    fn up(&self, txn: &mut Transaction<'_>) -> StoreResult<()> {
        let orphans: Vec<_> = txn
            .rows::<Completion>()
            .into_iter()
            .filter(|row| !row.known_remotely())
            .filter(|row| txn.get_row::<Habit>(&row.data.habit_id).is_none())
            .map(|row| row.data.key())
            .collect();
        for key in &orphans {
            txn.remove::<Completion>(key);
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "pruned orphan completions");
        }
        Ok(())
    }
}
