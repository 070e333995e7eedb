//! Write transactions over the local store.

use crate::error::{StoreError, StoreResult};
use crate::queue::QueueItem;
use crate::row::Row;
use crate::tables::{Entity, Mutation, Tables};
use chrono::{DateTime, Utc};
use habitsync_protocol::{QueuedMutation, SyncStatus};

/// An open write transaction.
///
/// Writes are visible to reads through the same transaction immediately.
/// They become durable, as one log record, when the closure passed to
/// [`crate::LocalStore::transaction`] returns `Ok`; on `Err` (or a failed
/// log append) every write is undone.
pub struct Transaction<'a> {
    tables: &'a mut Tables,
    undo: Vec<Mutation>,
    redo: Vec<Mutation>,
    max_retries: u32,
    now: DateTime<Utc>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(tables: &'a mut Tables, max_retries: u32) -> Self {
        Self {
            tables,
            undo: Vec::new(),
            redo: Vec::new(),
            max_retries,
            now: Utc::now(),
        }
    }

    /// Instant the transaction started.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Returns true if nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.redo.is_empty()
    }

    fn apply(&mut self, mutation: Mutation) {
        self.undo.push(self.tables.apply(mutation.clone()));
        self.redo.push(mutation);
    }

    pub(crate) fn into_parts(self) -> (Vec<Mutation>, Vec<Mutation>) {
        (self.redo, self.undo)
    }

    // ----- reads -----

    /// Returns a live entity by key.
    pub fn get<E: Entity>(&self, key: &E::Key) -> Option<&E> {
        self.get_row::<E>(key).filter(|r| r.is_live()).map(|r| &r.data)
    }

    /// Returns a row by key, tombstones included.
    pub fn get_row<E: Entity>(&self, key: &E::Key) -> Option<&Row<E>> {
        E::table(self.tables).get(key)
    }

    /// Lists live entities in key order.
    pub fn list<E: Entity>(&self) -> Vec<E> {
        E::table(self.tables)
            .values()
            .filter(|r| r.is_live())
            .map(|r| r.data.clone())
            .collect()
    }

    /// Lists all rows in key order, tombstones included.
    pub fn rows<E: Entity>(&self) -> Vec<Row<E>> {
        E::table(self.tables).values().cloned().collect()
    }

    // ----- local edits -----

    /// Inserts a new entity as pending.
    ///
    /// Re-creating over a pending tombstone revives the row, keeping its
    /// remote linkage.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if a live row has the same key.
    pub fn create<E: Entity>(&mut self, entity: E) -> StoreResult<()> {
        let key = entity.key();
        let last_synced_at = match self.get_row::<E>(&key) {
            Some(row) if row.is_live() => return Err(StoreError::already_exists(E::TYPE, key)),
            Some(row) => row.last_synced_at,
            None => None,
        };
        let mut row = Row::pending(entity);
        row.last_synced_at = last_synced_at;
        self.apply(E::put_mutation(row));
        Ok(())
    }

    /// Replaces a live entity and marks it pending.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no live row has this key.
    pub fn update<E: Entity>(&mut self, entity: E) -> StoreResult<()> {
        let key = entity.key();
        let last_synced_at = match self.get_row::<E>(&key) {
            Some(row) if row.is_live() => row.last_synced_at,
            _ => return Err(StoreError::not_found(E::TYPE, key)),
        };
        let mut row = Row::pending(entity);
        row.last_synced_at = last_synced_at;
        self.apply(E::put_mutation(row));
        Ok(())
    }

    /// Inserts or replaces an entity by natural key, as pending.
    pub fn upsert<E: Entity>(&mut self, entity: E) {
        let last_synced_at = self
            .get_row::<E>(&entity.key())
            .and_then(|row| row.last_synced_at);
        let mut row = Row::pending(entity);
        row.last_synced_at = last_synced_at;
        self.apply(E::put_mutation(row));
    }

    /// Deletes a live entity.
    ///
    /// A row the remote has never seen is removed outright. Otherwise it
    /// becomes a pending tombstone until the push phase confirms the remote
    /// delete. Returns the deleted entity.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no live row has this key.
    pub fn delete<E: Entity>(&mut self, key: &E::Key) -> StoreResult<E> {
        let row = match self.get_row::<E>(key) {
            Some(row) if row.is_live() => row.clone(),
            _ => return Err(StoreError::not_found(E::TYPE, key)),
        };
        let entity = row.data.clone();
        if row.known_remotely() {
            let mut tombstone = row;
            tombstone.deleted = true;
            tombstone.sync_status = SyncStatus::Pending;
            tombstone.error_message = None;
            self.apply(E::put_mutation(tombstone));
        } else {
            self.apply(E::remove_mutation(key.clone()));
        }
        Ok(entity)
    }

    // ----- sync bookkeeping -----

    /// Writes an entity as confirmed by the remote at `at`.
    pub fn put_synced<E: Entity>(&mut self, entity: E, at: DateTime<Utc>) {
        self.apply(E::put_mutation(Row::synced(entity, at)));
    }

    /// Writes a row verbatim.
    pub fn put_row<E: Entity>(&mut self, row: Row<E>) {
        self.apply(E::put_mutation(row));
    }

    /// Removes a row regardless of its state. Returns false if absent.
    pub fn remove<E: Entity>(&mut self, key: &E::Key) -> bool {
        if self.get_row::<E>(key).is_none() {
            return false;
        }
        self.apply(E::remove_mutation(key.clone()));
        true
    }

    /// Records that the remote confirmed a row at `at`.
    ///
    /// A confirmed tombstone is removed.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no row has this key.
    pub fn mark_synced<E: Entity>(&mut self, key: &E::Key, at: DateTime<Utc>) -> StoreResult<()> {
        let row = self
            .get_row::<E>(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(E::TYPE, key))?;
        if row.deleted {
            self.apply(E::remove_mutation(key.clone()));
        } else {
            let mut row = row;
            row.sync_status = SyncStatus::Synced;
            row.last_synced_at = Some(at);
            row.error_message = None;
            self.apply(E::put_mutation(row));
        }
        Ok(())
    }

    /// Records a failed push for a row.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no row has this key.
    pub fn mark_error<E: Entity>(&mut self, key: &E::Key, message: &str) -> StoreResult<()> {
        let mut row = self
            .get_row::<E>(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(E::TYPE, key))?;
        row.sync_status = SyncStatus::Error;
        row.error_message = Some(message.to_string());
        self.apply(E::put_mutation(row));
        Ok(())
    }

    // ----- sync queue -----

    /// Enqueues a remote mutation, due now. Returns the item id.
    pub fn enqueue(&mut self, mutation: QueuedMutation) -> u64 {
        let now = self.now;
        self.enqueue_at(mutation, now)
    }

    /// Enqueues a remote mutation, due at `now`. Returns the item id.
    pub fn enqueue_at(&mut self, mutation: QueuedMutation, now: DateTime<Utc>) -> u64 {
        let id = self.tables.next_queue_id();
        self.apply(Mutation::SetQueueSeq(id + 1));
        self.apply(Mutation::PutQueueItem(QueueItem::new(
            id,
            mutation,
            self.max_retries,
            now,
        )));
        id
    }

    /// Returns a queue item by id.
    pub fn queue_item(&self, id: u64) -> Option<&QueueItem> {
        self.tables.queue.get(&id)
    }

    /// Iterates queue items in id order.
    pub fn queue_items(&self) -> impl Iterator<Item = &QueueItem> {
        self.tables.queue.values()
    }

    /// Inserts or replaces a queue item.
    pub fn put_queue_item(&mut self, item: QueueItem) {
        self.apply(Mutation::PutQueueItem(item));
    }

    /// Removes a queue item. Returns false if absent.
    pub fn remove_queue_item(&mut self, id: u64) -> bool {
        if !self.tables.queue.contains_key(&id) {
            return false;
        }
        self.apply(Mutation::RemoveQueueItem(id));
        true
    }

    // ----- metadata -----

    /// Returns a metadata value.
    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.tables.meta.get(key).map(String::as_str)
    }

    /// Sets a metadata value.
    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.apply(Mutation::SetMeta {
            key: key.to_string(),
            value: value.into(),
        });
    }

    /// Removes a metadata value. Returns false if absent.
    pub fn remove_meta(&mut self, key: &str) -> bool {
        if !self.tables.meta.contains_key(key) {
            return false;
        }
        self.apply(Mutation::RemoveMeta(key.to_string()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use habitsync_protocol::{Completion, Habit};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    #[test]
    fn create_then_duplicate_fails() {
        let mut tables = Tables::default();
        let mut txn = Transaction::new(&mut tables, 5);
        let habit = Habit::new("u1", "Stretch", txn.now());
        txn.create(habit.clone()).unwrap();
        assert!(matches!(
            txn.create(habit),
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn update_requires_live_row() {
        let mut tables = Tables::default();
        let mut txn = Transaction::new(&mut tables, 5);
        let habit = Habit::new("u1", "Stretch", txn.now());
        assert!(matches!(
            txn.update(habit),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_unsynced_removes_row() {
        let mut tables = Tables::default();
        let mut txn = Transaction::new(&mut tables, 5);
        let completion = Completion::new("h1", day(3), txn.now());
        txn.create(completion.clone()).unwrap();
        txn.delete::<Completion>(&completion.key()).unwrap();
        assert!(txn.get_row::<Completion>(&completion.key()).is_none());
    }

    #[test]
    fn delete_synced_leaves_tombstone_until_confirmed() {
        let mut tables = Tables::default();
        let mut txn = Transaction::new(&mut tables, 5);
        let now = txn.now();
        let habit = Habit::new("u1", "Stretch", now);
        txn.put_synced(habit.clone(), now);

        txn.delete::<Habit>(&habit.id).unwrap();
        assert!(txn.get::<Habit>(&habit.id).is_none());
        let row = txn.get_row::<Habit>(&habit.id).unwrap();
        assert!(row.deleted);
        assert_eq!(row.sync_status, SyncStatus::Pending);

        txn.mark_synced::<Habit>(&habit.id, now).unwrap();
        assert!(txn.get_row::<Habit>(&habit.id).is_none());
    }

    #[test]
    fn update_keeps_remote_linkage() {
        let mut tables = Tables::default();
        let mut txn = Transaction::new(&mut tables, 5);
        let now = txn.now();
        let mut habit = Habit::new("u1", "Stretch", now);
        txn.put_synced(habit.clone(), now);

        habit.name = "Stretch more".into();
        txn.update(habit.clone()).unwrap();
        let row = txn.get_row::<Habit>(&habit.id).unwrap();
        assert_eq!(row.sync_status, SyncStatus::Pending);
        assert_eq!(row.last_synced_at, Some(now));
    }

    #[test]
    fn mark_error_records_message() {
        let mut tables = Tables::default();
        let mut txn = Transaction::new(&mut tables, 5);
        let habit = Habit::new("u1", "Stretch", txn.now());
        txn.create(habit.clone()).unwrap();
        txn.mark_error::<Habit>(&habit.id, "validation: name").unwrap();

        let row = txn.get_row::<Habit>(&habit.id).unwrap();
        assert_eq!(row.sync_status, SyncStatus::Error);
        assert_eq!(row.error_message.as_deref(), Some("validation: name"));
    }

    #[test]
    fn undo_log_restores_tables() {
        let mut tables = Tables::default();
        let before = tables.clone();
        let mut txn = Transaction::new(&mut tables, 5);
        let habit = Habit::new("u1", "Stretch", txn.now());
        txn.create(habit).unwrap();
        txn.enqueue(QueuedMutation::DeleteHabit { id: "x".into() });
        txn.set_meta("k", "v");
        let (_, undo) = txn.into_parts();

        for mutation in undo.into_iter().rev() {
            tables.apply(mutation);
        }
        assert_eq!(tables, before);
    }
}
