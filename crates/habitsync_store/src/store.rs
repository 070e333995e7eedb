//! The local store: tables in memory, durability through an append-only log.

use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::meta;
use crate::migration::{MigrationManager, LATEST_SCHEMA_VERSION};
use crate::queue::SyncQueue;
use crate::record::{LogReader, LogRecord, RecordKind};
use crate::row::Row;
use crate::tables::{Entity, Tables};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use habitsync_protocol::{
    Badge, Completion, EntityType, Habit, StepRecord, SyncStatus, UserBadge,
};
use habitsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Durable on-device cache of habits, completions, step records and badges,
/// plus the sync queue and a metadata table.
///
/// Reads are served from memory. Every write goes through
/// [`LocalStore::transaction`] and is appended to the log as one record
/// before the call returns.
///
/// # Example
///
/// ```ignore
/// let store = LocalStore::open(Path::new("./cache"))?;
/// store.transaction(|txn| {
///     txn.create(habit.clone())?;
///     txn.enqueue(QueuedMutation::CreateHabit(habit));
///     Ok(())
/// })?;
/// ```
pub struct LocalStore {
    tables: RwLock<Tables>,
    backend: Mutex<Box<dyn StorageBackend>>,
    config: StoreConfig,
    dir: Option<StoreDir>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens or creates a store directory with default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked by another process, the log is
    /// corrupted, or the schema is newer than this build supports.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::open`].
    pub fn open_with_config(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.log_path())?;
        let mut store = Self::recover(Box::new(backend), config)?;
        store.dir = Some(dir);
        store.initialize()?;
        info!(path = %path.display(), schema = store.schema_version(), "local store opened");
        Ok(store)
    }

    /// Opens a store over an arbitrary backend.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::open`].
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        let store = Self::recover(backend, config)?;
        store.initialize()?;
        Ok(store)
    }

    /// Opens a fresh, non-persistent store.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in migrations fail.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open_with_backend(
            Box::new(InMemoryBackend::new()),
            StoreConfig::default().sync_on_commit(false),
        )
    }

    /// Replays the log into fresh tables, cutting off a torn tail.
    fn recover(mut backend: Box<dyn StorageBackend>, config: StoreConfig) -> StoreResult<Self> {
        let data = backend.read_all()?;
        let mut tables = Tables::default();
        let mut reader = LogReader::new(&data);
        let mut records = 0usize;

        for item in &mut reader {
            let (offset, record) = item?;
            if record.kind == RecordKind::Snapshot {
                tables = Tables::default();
            }
            debug!(offset, kind = record.kind.as_str(), mutations = record.mutations.len(), "replaying log record");
            for mutation in record.mutations {
                tables.apply(mutation);
            }
            records += 1;
        }

        if let Some(torn_at) = reader.torn_at() {
            warn!(
                offset = torn_at,
                dropped_bytes = data.len() as u64 - torn_at,
                "truncating incomplete record at log tail"
            );
            backend.truncate(reader.valid_len())?;
        }

        debug!(records, rows = tables.row_count(), "log replay complete");

        Ok(Self {
            tables: RwLock::new(tables),
            backend: Mutex::new(backend),
            config,
            dir: None,
        })
    }

    fn initialize(&self) -> StoreResult<()> {
        let found = self.schema_version();
        if found > LATEST_SCHEMA_VERSION {
            return Err(StoreError::IncompatibleSchema {
                found,
                supported: LATEST_SCHEMA_VERSION,
            });
        }
        if self.config.run_migrations {
            MigrationManager::with_builtin().run_pending(self)?;
        }
        Ok(())
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the store directory, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    // ----- transactions -----

    /// Runs `f` as one atomic batch.
    ///
    /// All writes made through the transaction commit together as a single
    /// log record, or not at all: if `f` returns an error, or the log append
    /// fails, every write is rolled back and the error returned.
    pub fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<T>,
    {
        let mut tables = self.tables.write();
        let mut txn = Transaction::new(&mut tables, self.config.retry.max_retries);
        let result = f(&mut txn);
        let (redo, undo) = txn.into_parts();

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                rollback(&mut tables, undo);
                return Err(e);
            }
        };

        if redo.is_empty() {
            return Ok(value);
        }

        let count = redo.len();
        if let Err(e) = self.append_record(&LogRecord::batch(redo)) {
            warn!(error = %e, "commit failed, rolling back");
            rollback(&mut tables, undo);
            return Err(e);
        }
        debug!(mutations = count, "transaction committed");
        Ok(value)
    }

    fn append_record(&self, record: &LogRecord) -> StoreResult<()> {
        let bytes = record.encode()?;
        let mut backend = self.backend.lock();
        let start = backend.size()?;

        if let Err(e) = write_record(&mut **backend, &bytes, self.config.sync_on_commit) {
            if let Err(cleanup) = backend.truncate(start) {
                warn!(error = %cleanup, offset = start, "failed to cut partial record");
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&*self.tables.read())
    }

    // ----- reads -----

    /// Returns a live entity by key.
    pub fn get<E: Entity>(&self, key: &E::Key) -> Option<E> {
        self.read(|t| {
            E::table(t)
                .get(key)
                .filter(|r| r.is_live())
                .map(|r| r.data.clone())
        })
    }

    /// Returns a row by key, tombstones included.
    pub fn get_row<E: Entity>(&self, key: &E::Key) -> Option<Row<E>> {
        self.read(|t| E::table(t).get(key).cloned())
    }

    /// Lists live entities in key order.
    pub fn list<E: Entity>(&self) -> Vec<E> {
        self.read(|t| {
            E::table(t)
                .values()
                .filter(|r| r.is_live())
                .map(|r| r.data.clone())
                .collect()
        })
    }

    /// Lists all rows in key order, tombstones included.
    pub fn rows<E: Entity>(&self) -> Vec<Row<E>> {
        self.read(|t| E::table(t).values().cloned().collect())
    }

    /// Rows with local changes the remote has not confirmed: pending,
    /// errored and tombstoned rows.
    pub fn get_pending_sync<E: Entity>(&self) -> Vec<Row<E>> {
        self.read(|t| E::table(t).values().filter(|r| r.needs_push()).cloned().collect())
    }

    /// Returns a clone of the full table state.
    pub fn state(&self) -> Tables {
        self.read(Tables::clone)
    }

    // ----- single-write conveniences -----

    /// Inserts a new entity as pending. See [`Transaction::create`].
    pub fn create<E: Entity>(&self, entity: E) -> StoreResult<()> {
        self.transaction(|txn| txn.create(entity))
    }

    /// Replaces a live entity. See [`Transaction::update`].
    pub fn update<E: Entity>(&self, entity: E) -> StoreResult<()> {
        self.transaction(|txn| txn.update(entity))
    }

    /// Inserts or replaces an entity. See [`Transaction::upsert`].
    pub fn upsert<E: Entity>(&self, entity: E) -> StoreResult<()> {
        self.transaction(|txn| {
            txn.upsert(entity);
            Ok(())
        })
    }

    /// Deletes a live entity. See [`Transaction::delete`].
    pub fn delete<E: Entity>(&self, key: &E::Key) -> StoreResult<E> {
        self.transaction(|txn| txn.delete::<E>(key))
    }

    /// Writes an entity as confirmed by the remote at `at`.
    pub fn put_synced<E: Entity>(&self, entity: E, at: DateTime<Utc>) -> StoreResult<()> {
        self.transaction(|txn| {
            txn.put_synced(entity, at);
            Ok(())
        })
    }

    /// Records that the remote confirmed a row. See [`Transaction::mark_synced`].
    pub fn mark_synced<E: Entity>(&self, key: &E::Key, at: DateTime<Utc>) -> StoreResult<()> {
        self.transaction(|txn| txn.mark_synced::<E>(key, at))
    }

    /// Records a failed push. See [`Transaction::mark_error`].
    pub fn mark_error<E: Entity>(&self, key: &E::Key, message: &str) -> StoreResult<()> {
        self.transaction(|txn| txn.mark_error::<E>(key, message))
    }

    // ----- metadata -----

    /// Returns a metadata value.
    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.read(|t| t.meta.get(key).cloned())
    }

    /// Sets a metadata value.
    pub fn set_meta(&self, key: &str, value: impl Into<String>) -> StoreResult<()> {
        let value = value.into();
        self.transaction(|txn| {
            txn.set_meta(key, value);
            Ok(())
        })
    }

    /// Returns a metadata value parsed as an RFC 3339 instant.
    pub fn get_meta_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get_meta(key)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Schema version recorded in the store; 0 for a fresh store.
    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.get_meta(meta::SCHEMA_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    // ----- queue -----

    /// Returns a handle over the sync queue.
    #[must_use]
    pub fn queue(&self) -> SyncQueue<'_> {
        SyncQueue::new(self)
    }

    // ----- maintenance -----

    /// Collects per-table and queue statistics.
    ///
    /// # Errors
    ///
    /// Fails if the log size cannot be read.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        self.stats_at(Utc::now())
    }

    /// Collects statistics, counting queue items due at `now`.
    ///
    /// # Errors
    ///
    /// Fails if the log size cannot be read.
    pub fn stats_at(&self, now: DateTime<Utc>) -> StoreResult<StoreStats> {
        let log_size = self.backend.lock().size()?;
        Ok(self.read(|t| StoreStats {
            schema_version: t
                .meta
                .get(meta::SCHEMA_VERSION)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            tables: vec![
                TableStats::collect::<Habit>(t),
                TableStats::collect::<Completion>(t),
                TableStats::collect::<StepRecord>(t),
                TableStats::collect::<Badge>(t),
                TableStats::collect::<UserBadge>(t),
            ],
            queue: QueueStats {
                total: t.queue.len(),
                due: t.queue.values().filter(|i| i.is_due(now)).count(),
                dead_lettered: t.queue.values().filter(|i| i.is_dead_lettered()).count(),
            },
            meta_entries: t.meta.len(),
            log_size,
        }))
    }

    /// Rewrites the log as a single snapshot record.
    ///
    /// Writers are blocked for the duration; the swap itself is atomic.
    ///
    /// # Errors
    ///
    /// Fails if encoding or the backend replace fails. The old log is left
    /// intact in that case.
    pub fn compact(&self) -> StoreResult<CompactStats> {
        let tables = self.tables.read();
        let bytes = LogRecord::snapshot(tables.snapshot()).encode()?;
        let mut backend = self.backend.lock();
        let before = backend.size()?;
        backend.replace(&bytes)?;
        let stats = CompactStats {
            before,
            after: bytes.len() as u64,
        };
        info!(before = stats.before, after = stats.after, "log compacted");
        Ok(stats)
    }

    /// Size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot report its size.
    pub fn log_size(&self) -> StoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}

fn write_record(
    backend: &mut dyn StorageBackend,
    bytes: &[u8],
    sync: bool,
) -> habitsync_storage::StorageResult<()> {
    backend.append(bytes)?;
    backend.flush()?;
    if sync {
        backend.sync()?;
    }
    Ok(())
}

fn rollback(tables: &mut Tables, undo: Vec<crate::tables::Mutation>) {
    for mutation in undo.into_iter().rev() {
        tables.apply(mutation);
    }
}

/// Row counts of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Table.
    pub entity_type: EntityType,
    /// All rows, tombstones included.
    pub total: usize,
    /// Rows matching the remote.
    pub synced: usize,
    /// Rows waiting to be pushed.
    pub pending: usize,
    /// Rows whose last push failed.
    pub error: usize,
    /// Pending deletions.
    pub tombstones: usize,
}

impl TableStats {
    fn collect<E: Entity>(tables: &Tables) -> Self {
        let mut stats = Self {
            entity_type: E::TYPE,
            total: 0,
            synced: 0,
            pending: 0,
            error: 0,
            tombstones: 0,
        };
        for row in E::table(tables).values() {
            stats.total += 1;
            match row.sync_status {
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Error => stats.error += 1,
            }
            if row.deleted {
                stats.tombstones += 1;
            }
        }
        stats
    }
}

/// Sync queue counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// All items.
    pub total: usize,
    /// Items eligible for replay now.
    pub due: usize,
    /// Items that ran out of retries.
    pub dead_lettered: usize,
}

/// Snapshot of store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Schema version.
    pub schema_version: u64,
    /// Per-table counts.
    pub tables: Vec<TableStats>,
    /// Queue counts.
    pub queue: QueueStats,
    /// Metadata entries.
    pub meta_entries: usize,
    /// Log size in bytes.
    pub log_size: u64,
}

/// Log sizes around a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    /// Bytes before.
    pub before: u64,
    /// Bytes after.
    pub after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitsync_protocol::QueuedMutation;
    use habitsync_storage::FaultyBackend;

    #[test]
    fn fresh_store_is_migrated() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version(), LATEST_SCHEMA_VERSION);
        assert!(store.get_meta(meta::CREATED_AT).is_some());
    }

    #[test]
    fn reads_reflect_writes_immediately() {
        let store = LocalStore::open_in_memory().unwrap();
        let habit = Habit::new("u1", "Meditate", Utc::now());
        store.create(habit.clone()).unwrap();

        assert_eq!(store.get::<Habit>(&habit.id), Some(habit.clone()));
        assert_eq!(store.list::<Habit>().len(), 1);
        assert_eq!(store.get_pending_sync::<Habit>().len(), 1);
    }

    #[test]
    fn failed_closure_rolls_back_everything() {
        let store = LocalStore::open_in_memory().unwrap();
        let before = store.state();
        let habit = Habit::new("u1", "Meditate", Utc::now());

        let result: StoreResult<()> = store.transaction(|txn| {
            txn.create(habit.clone())?;
            txn.enqueue(QueuedMutation::CreateHabit(habit.clone()));
            Err(StoreError::InvalidArgument("abort".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.state(), before);
    }

    #[test]
    fn failed_append_rolls_back_and_leaves_log_clean() {
        let (backend, switch) = FaultyBackend::new(InMemoryBackend::new());
        let store = LocalStore::open_with_backend(Box::new(backend), StoreConfig::default()).unwrap();
        let before = store.state();
        let size = store.log_size().unwrap();

        switch.tear_writes();
        let habit = Habit::new("u1", "Meditate", Utc::now());
        assert!(store.create(habit.clone()).is_err());

        assert_eq!(store.state(), before);
        assert_eq!(store.log_size().unwrap(), size);

        switch.heal();
        store.create(habit).unwrap();
    }

    #[test]
    fn empty_transaction_writes_nothing() {
        let store = LocalStore::open_in_memory().unwrap();
        let size = store.log_size().unwrap();
        store.transaction(|_| Ok(())).unwrap();
        assert_eq!(store.log_size().unwrap(), size);
    }

    #[test]
    fn compaction_preserves_state() {
        let backend = InMemoryBackend::new();
        let store = LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default()).unwrap();
        let mut habit = Habit::new("u1", "Meditate", Utc::now());
        store.create(habit.clone()).unwrap();
        for i in 0..5 {
            habit.name = format!("Meditate {i}");
            store.update(habit.clone()).unwrap();
        }
        let state = store.state();
        let stats = store.compact().unwrap();
        assert!(stats.after < stats.before);
        drop(store);

        let reopened = LocalStore::open_with_backend(Box::new(backend), StoreConfig::default()).unwrap();
        assert_eq!(reopened.state(), state);
    }

    #[test]
    fn stats_count_rows_by_status() {
        let store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(Habit::new("u1", "A", now)).unwrap();
        store.put_synced(Habit::new("u1", "B", now), now).unwrap();

        let stats = store.stats().unwrap();
        let habits = &stats.tables[0];
        assert_eq!(habits.entity_type, EntityType::Habit);
        assert_eq!(habits.total, 2);
        assert_eq!(habits.synced, 1);
        assert_eq!(habits.pending, 1);
        assert!(stats.log_size > 0);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let backend = InMemoryBackend::new();
        let store = LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default()).unwrap();
        store
            .set_meta(meta::SCHEMA_VERSION, (LATEST_SCHEMA_VERSION + 1).to_string())
            .unwrap();
        drop(store);

        let result = LocalStore::open_with_backend(Box::new(backend), StoreConfig::default());
        assert!(matches!(result, Err(StoreError::IncompatibleSchema { .. })));
    }
}
