//! The four phases of a sync pass.
//!
//! Each phase reads the rows it needs, talks to the remote, then commits its
//! result in local transactions. Decisions about a row are always taken on
//! its state inside the committing transaction, so local edits made while a
//! remote call was in flight are never overwritten.

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{Engine, SyncCounts};
use crate::remote::{CompletionFilter, RemoteError};
use chrono::{DateTime, Utc};
use habitsync_protocol::{
    merge_completions, merge_step_records, resolve_habit, resolve_step_record, Badge, Completion,
    CompletionKey, Habit, QueuedMutation, StepRecord, SyncStatus, UserBadge,
};
use habitsync_store::{meta, Entity, QueueItem, Row, StoreResult, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};

/// Maps a remote `NotFound` to success; deleting something already gone is
/// the desired end state.
fn ignore_not_found<T>(result: SyncResult<T>) -> SyncResult<()> {
    match result {
        Ok(_) | Err(SyncError::Remote(RemoteError::NotFound(_))) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Inserts entities that have no local row yet. Returns how many.
fn insert_missing<E: Entity>(txn: &mut Transaction<'_>, entities: Vec<E>, at: DateTime<Utc>) -> usize {
    let mut inserted = 0;
    for entity in entities {
        if txn.get_row::<E>(&entity.key()).is_none() {
            txn.put_synced(entity, at);
            inserted += 1;
        }
    }
    inserted
}

/// Makes a server-owned table match the remote. Returns (written, removed).
fn replace_table<E: Entity + PartialEq>(
    txn: &mut Transaction<'_>,
    remote: Vec<E>,
    at: DateTime<Utc>,
) -> (usize, usize) {
    let keys: BTreeSet<E::Key> = remote.iter().map(Entity::key).collect();
    let mut written = 0;
    for entity in remote {
        let unchanged = txn
            .get_row::<E>(&entity.key())
            .is_some_and(|row| row.sync_status == SyncStatus::Synced && row.data == entity);
        if !unchanged {
            txn.put_synced(entity, at);
            written += 1;
        }
    }

    let stale: Vec<E::Key> = txn
        .rows::<E>()
        .into_iter()
        .map(|row| row.data.key())
        .filter(|key| !keys.contains(key))
        .collect();
    for key in &stale {
        txn.remove::<E>(key);
    }
    (written, stale.len())
}

/// Error recorded on completions whose habit the remote removed before they
/// were pushed.
const HABIT_REMOVED_REMOTELY: &str = "habit no longer exists on the remote";

/// Handles the completions of a habit the remote no longer has.
///
/// Confirmed rows and tombstones are removed. Rows never pushed are kept in
/// `error` so the mark is not lost silently. Returns (removed, kept).
fn detach_completions_of(txn: &mut Transaction<'_>, habit_id: &str) -> StoreResult<(usize, usize)> {
    let rows: Vec<Row<Completion>> = txn
        .rows::<Completion>()
        .into_iter()
        .filter(|row| row.data.habit_id == habit_id)
        .collect();

    let (mut removed, mut kept) = (0, 0);
    for row in rows {
        let key = row.data.key();
        if row.deleted || row.sync_status == SyncStatus::Synced {
            txn.remove::<Completion>(&key);
            removed += 1;
        } else {
            warn!(%key, "habit removed on the remote, keeping unpushed completion as error");
            txn.mark_error::<Completion>(&key, HABIT_REMOVED_REMOTELY)?;
            kept += 1;
        }
    }
    Ok((removed, kept))
}

/// Removes every completion row of a habit.
fn remove_completions_of(txn: &mut Transaction<'_>, habit_id: &str) -> usize {
    let keys: Vec<CompletionKey> = txn
        .rows::<Completion>()
        .into_iter()
        .filter(|row| row.data.habit_id == habit_id)
        .map(|row| row.data.key())
        .collect();
    for key in &keys {
        txn.remove::<Completion>(key);
    }
    keys.len()
}

impl Engine {
    // ----- import -----

    /// Seeds an empty cache from the remote snapshot, once per store.
    pub(crate) async fn import(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        if self.store.get_meta(meta::INITIAL_IMPORT_COMPLETE).is_some() {
            return Ok(());
        }

        info!("running first-run import");
        let (start, end) = self.window();
        let habits = self.call(self.remote.list_habits(true)).await?;
        let completions = self.call(self.remote.list_completions(None)).await?;
        let steps: Vec<StepRecord> = self
            .call(self.remote.list_steps(start, end))
            .await?
            .into_iter()
            .filter(|r| r.user_id == self.config.user_id)
            .collect();
        let badges = self.call(self.remote.list_badges()).await?;
        let user_badges: Vec<UserBadge> = self
            .call(self.remote.list_user_badges())
            .await?
            .into_iter()
            .filter(|b| b.user_id == self.config.user_id)
            .collect();

        let now = Utc::now();
        let imported = self.store.transaction(|txn| {
            let mut imported = insert_missing(txn, habits, now);
            imported += insert_missing(txn, completions, now);
            imported += insert_missing(txn, steps, now);
            imported += insert_missing(txn, badges, now);
            imported += insert_missing(txn, user_badges, now);
            txn.set_meta(meta::INITIAL_IMPORT_COMPLETE, now.to_rfc3339());
            Ok(imported)
        })?;

        counts.imported += imported;
        info!(imported, "first-run import complete");
        Ok(())
    }

    // ----- push -----

    /// Uploads pending rows: habits, then completions, then step records.
    pub(crate) async fn push(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        self.push_habits(counts).await?;
        self.push_completions(counts).await?;
        self.push_steps(counts).await?;
        self.store.set_meta(meta::LAST_PUSH_AT, Utc::now().to_rfc3339())?;
        Ok(())
    }

    async fn push_habits(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        for row in self.store.get_pending_sync::<Habit>() {
            let id = row.data.id.clone();
            let result = if row.deleted {
                ignore_not_found(self.call(self.remote.delete_habit(&id)).await)
            } else if row.known_remotely() {
                self.call(self.remote.update_habit(&id, &row.data)).await.map(drop)
            } else {
                match self.call(self.remote.create_habit(&row.data)).await {
                    // An earlier create landed but its confirmation was lost.
                    Err(SyncError::Remote(RemoteError::Conflict(_))) => self
                        .call(self.remote.update_habit(&id, &row.data))
                        .await
                        .map(drop),
                    other => other.map(drop),
                }
            };

            let confirmed = self.settle(&row, result, counts)?;
            if confirmed && row.deleted {
                let removed = self.store.transaction(|txn| Ok(remove_completions_of(txn, &id)))?;
                debug!(habit = %id, removed, "dropped completions of deleted habit");
            }
        }
        Ok(())
    }

    async fn push_completions(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        for row in self.store.get_pending_sync::<Completion>() {
            let completion = &row.data;
            let result = if row.deleted {
                ignore_not_found(
                    self.call(self.remote.delete_completion(&completion.habit_id, completion.date))
                        .await,
                )
            } else {
                let habit = self.store.get_row::<Habit>(&completion.habit_id);
                if habit.is_none() && row.sync_status == SyncStatus::Error {
                    // Orphaned by a remote habit removal; nothing to push to.
                    continue;
                }
                if !habit.is_some_and(|habit| habit.known_remotely()) {
                    debug!(key = %completion.key(), "completion deferred until its habit is pushed");
                    counts.deferred += 1;
                    continue;
                }
                self.call(self.remote.create_completion(&completion.habit_id, completion.date))
                    .await
                    .map(drop)
            };
            self.settle(&row, result, counts)?;
        }
        Ok(())
    }

    async fn push_steps(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        for row in self.store.get_pending_sync::<StepRecord>() {
            // The remote has no step deletion; a local delete only drops the cache row.
            if row.deleted {
                self.settle(&row, Ok(()), counts)?;
                continue;
            }

            let merged = match self.log_merged_steps(&row.data).await {
                Ok(merged) => merged,
                Err(e) => {
                    self.settle(&row, Err(e), counts)?;
                    continue;
                }
            };

            let key = row.data.key();
            let confirmed = self.store.transaction(|txn| {
                let unchanged = txn
                    .get_row::<StepRecord>(&key)
                    .is_some_and(|current| current.data == row.data && !current.deleted);
                if unchanged {
                    let now = txn.now();
                    txn.put_synced(merged.clone(), now);
                }
                Ok(unchanged)
            })?;
            counts.pushed += 1;
            if confirmed {
                debug!(%key, steps = merged.steps, "step record pushed");
            } else {
                debug!(%key, "step record changed during push, left pending");
            }
        }
        Ok(())
    }

    /// Uploads the per-field maximum of `record` and the remote's reading for
    /// the same day. Returns the value the remote holds afterwards.
    ///
    /// `log_steps` replaces the remote day, so a stale reading is never
    /// uploaded as is. No call is made when the remote already holds the
    /// maximum.
    async fn log_merged_steps(&self, record: &StepRecord) -> SyncResult<StepRecord> {
        let remote = self
            .call(self.remote.list_steps(record.date, record.date))
            .await?
            .into_iter()
            .find(|r| r.user_id == record.user_id && r.date == record.date);

        match remote {
            Some(remote) => {
                let merged = resolve_step_record(record, &remote);
                if merged != remote {
                    self.call(self.remote.log_steps(&merged)).await?;
                }
                Ok(merged)
            }
            None => {
                self.call(self.remote.log_steps(record)).await?;
                Ok(record.clone())
            }
        }
    }

    /// Records the outcome of pushing one row. Returns true if the row was
    /// confirmed.
    ///
    /// A connectivity failure is returned as an error to stop the phase; any
    /// other failure is stored on the row.
    fn settle<E: Entity + PartialEq>(
        &self,
        pushed: &Row<E>,
        result: SyncResult<()>,
        counts: &mut SyncCounts,
    ) -> SyncResult<bool> {
        let key = pushed.data.key();
        match result {
            Ok(()) => {
                let confirmed = self.store.transaction(|txn| {
                    let unchanged = txn
                        .get_row::<E>(&key)
                        .is_some_and(|row| row.data == pushed.data && row.deleted == pushed.deleted);
                    if unchanged {
                        let now = txn.now();
                        txn.mark_synced::<E>(&key, now)?;
                    }
                    Ok(unchanged)
                })?;
                counts.pushed += 1;
                if confirmed {
                    debug!(entity_type = %E::TYPE, %key, "pushed");
                } else {
                    debug!(entity_type = %E::TYPE, %key, "row changed during push, left pending");
                }
                Ok(confirmed)
            }
            Err(e) if e.is_connectivity() => Err(e),
            Err(e) => {
                warn!(entity_type = %E::TYPE, %key, error = %e, "push rejected");
                let message = e.to_string();
                self.store.transaction(|txn| {
                    if txn.get_row::<E>(&key).is_some() {
                        txn.mark_error::<E>(&key, &message)?;
                    }
                    Ok(())
                })?;
                counts.push_failed += 1;
                Ok(false)
            }
        }
    }

    // ----- pull -----

    /// Downloads remote state and merges it into rows that have no local
    /// changes.
    pub(crate) async fn pull(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        self.pull_habits(counts).await?;
        self.pull_completions(counts).await?;
        self.pull_steps(counts).await?;
        self.pull_badges(counts).await?;
        self.store.set_meta(meta::LAST_PULL_AT, Utc::now().to_rfc3339())?;
        Ok(())
    }

    async fn pull_habits(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        let include_archived = self.config.include_archived;
        let remote = self.call(self.remote.list_habits(include_archived)).await?;
        let now = Utc::now();

        let (written, removed) = self.store.transaction(|txn| {
            let mut written = 0;
            for habit in &remote {
                match txn.get_row::<Habit>(&habit.id).cloned() {
                    None => {
                        txn.put_synced(habit.clone(), now);
                        written += 1;
                    }
                    Some(row) if row.sync_status == SyncStatus::Synced && !row.deleted => {
                        let resolved = resolve_habit(&row.data, habit);
                        if resolved == *habit {
                            if row.data != *habit {
                                txn.put_synced(resolved, now);
                                written += 1;
                            }
                        } else {
                            // Local copy is newer than the remote's: push it next time.
                            txn.put_row(Row {
                                data: resolved,
                                sync_status: SyncStatus::Pending,
                                ..row
                            });
                            written += 1;
                        }
                    }
                    Some(_) => {}
                }
            }

            let remote_ids: HashSet<&str> = remote.iter().map(|h| h.id.as_str()).collect();
            let gone: Vec<String> = txn
                .rows::<Habit>()
                .into_iter()
                .filter(|row| row.sync_status == SyncStatus::Synced && !row.deleted)
                .filter(|row| include_archived || !row.data.archived)
                .filter(|row| !remote_ids.contains(row.data.id.as_str()))
                .map(|row| row.data.id)
                .collect();
            for id in &gone {
                txn.remove::<Habit>(id);
                let (_, kept) = detach_completions_of(txn, id)?;
                if kept > 0 {
                    debug!(habit = %id, kept, "unpushed completions kept after remote removal");
                }
            }
            Ok((written, gone.len()))
        })?;

        counts.pulled += written;
        counts.removed += removed;
        debug!(remote = remote.len(), written, removed, "habits pulled");
        Ok(())
    }

    async fn pull_completions(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        let (start, end) = self.window();
        let filter = CompletionFilter::between(start, end);
        let remote = self.call(self.remote.list_completions(Some(&filter))).await?;
        let now = Utc::now();

        let written = self.store.transaction(|txn| {
            let on_remote: HashSet<CompletionKey> = remote.iter().map(Completion::key).collect();
            let local: Vec<Completion> = txn
                .rows::<Completion>()
                .into_iter()
                .filter(|row| !row.deleted && filter.matches(&row.data))
                .map(|row| row.data)
                .collect();

            let mut written = 0;
            for completion in merge_completions(&local, &remote) {
                if txn.get_row::<Habit>(&completion.habit_id).is_none() {
                    continue;
                }
                let key = completion.key();
                let existing = txn.get_row::<Completion>(&key).cloned();
                match existing {
                    Some(row) if row.deleted => {}
                    // The remote holds it: presence is the whole value.
                    Some(row) if on_remote.contains(&key) => {
                        if row.sync_status != SyncStatus::Synced || row.data != completion {
                            txn.put_synced(completion, now);
                            written += 1;
                        }
                    }
                    None => {
                        txn.put_synced(completion, now);
                        written += 1;
                    }
                    // Local only. Synced means the remote dropped it; the union keeps it.
                    Some(row) => {
                        if row.sync_status == SyncStatus::Synced {
                            txn.put_row(Row {
                                data: completion,
                                sync_status: SyncStatus::Pending,
                                ..row
                            });
                            written += 1;
                        }
                    }
                }
            }
            Ok(written)
        })?;

        counts.pulled += written;
        debug!(remote = remote.len(), written, "completions pulled");
        Ok(())
    }

    async fn pull_steps(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        let (start, end) = self.window();
        let user_id = self.config.user_id.as_str();
        let remote: Vec<StepRecord> = self
            .call(self.remote.list_steps(start, end))
            .await?
            .into_iter()
            .filter(|r| r.user_id == user_id)
            .collect();
        let now = Utc::now();

        let written = self.store.transaction(|txn| {
            let remote_by_date: BTreeMap<_, &StepRecord> =
                remote.iter().map(|r| (r.date, r)).collect();
            let local: Vec<StepRecord> = txn
                .rows::<StepRecord>()
                .into_iter()
                .filter(|row| !row.deleted && row.data.user_id == user_id)
                .filter(|row| row.data.date >= start && row.data.date <= end)
                .map(|row| row.data)
                .collect();

            let mut written = 0;
            for record in merge_step_records(&local, &remote) {
                let existing = txn.get_row::<StepRecord>(&record.key()).cloned();
                if existing.as_ref().is_some_and(|row| row.deleted) {
                    continue;
                }
                let remote_holds = remote_by_date.get(&record.date) == Some(&&record);
                if remote_holds {
                    let current = existing
                        .as_ref()
                        .is_some_and(|row| row.sync_status == SyncStatus::Synced && row.data == record);
                    if !current {
                        txn.put_synced(record, now);
                        written += 1;
                    }
                    continue;
                }
                match existing {
                    Some(row) if row.data == record && row.sync_status != SyncStatus::Synced => {}
                    Some(row) => {
                        txn.put_row(Row {
                            data: record,
                            sync_status: SyncStatus::Pending,
                            error_message: None,
                            ..row
                        });
                        written += 1;
                    }
                    None => {
                        txn.put_row(Row::pending(record));
                        written += 1;
                    }
                }
            }
            Ok(written)
        })?;

        counts.pulled += written;
        debug!(remote = remote.len(), written, "step records pulled");
        Ok(())
    }

    async fn pull_badges(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        let badges: Vec<Badge> = self.call(self.remote.list_badges()).await?;
        let user_badges: Vec<UserBadge> = self
            .call(self.remote.list_user_badges())
            .await?
            .into_iter()
            .filter(|b| b.user_id == self.config.user_id)
            .collect();
        let now = Utc::now();

        let (written, removed) = self.store.transaction(|txn| {
            let (w1, r1) = replace_table(txn, badges, now);
            let (w2, r2) = replace_table(txn, user_badges, now);
            Ok((w1 + w2, r1 + r2))
        })?;

        counts.pulled += written;
        counts.removed += removed;
        Ok(())
    }

    // ----- queue drain -----

    /// Replays due queue items in creation order.
    pub(crate) async fn drain(&self, counts: &mut SyncCounts) -> SyncResult<()> {
        let queue = self.store.queue();
        for item in queue.get_pending() {
            if self.is_superseded(&item) {
                queue.mark_succeeded(item.id)?;
                counts.queue_superseded += 1;
                debug!(id = item.id, "queue item already landed by push");
                continue;
            }

            match self.replay(&item.payload).await {
                Ok(()) => {
                    queue.mark_succeeded(item.id)?;
                    counts.queue_replayed += 1;
                    debug!(id = item.id, entity_type = %item.entity_type, operation = %item.operation, "queue item replayed");
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    queue.mark_failed(item.id, &e.to_string())?;
                    counts.queue_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// An item is superseded once its row was confirmed after the item was
    /// enqueued.
    fn is_superseded(&self, item: &QueueItem) -> bool {
        fn confirmed_since<E: Entity>(row: Option<Row<E>>, since: DateTime<Utc>) -> bool {
            row.is_some_and(|row| {
                row.sync_status == SyncStatus::Synced
                    && !row.deleted
                    && row.last_synced_at.is_some_and(|at| at >= since)
            })
        }

        let since = item.created_at;
        match &item.payload {
            QueuedMutation::CreateHabit(habit) | QueuedMutation::UpdateHabit(habit) => {
                confirmed_since(self.store.get_row::<Habit>(&habit.id), since)
            }
            QueuedMutation::DeleteHabit { id } => {
                confirmed_since(self.store.get_row::<Habit>(id), since)
            }
            QueuedMutation::CreateCompletion { habit_id, date }
            | QueuedMutation::DeleteCompletion { habit_id, date } => confirmed_since(
                self.store.get_row::<Completion>(&CompletionKey {
                    habit_id: habit_id.clone(),
                    date: *date,
                }),
                since,
            ),
            QueuedMutation::LogSteps(record) => {
                confirmed_since(self.store.get_row::<StepRecord>(&record.key()), since)
            }
        }
    }

    async fn replay(&self, mutation: &QueuedMutation) -> SyncResult<()> {
        match mutation {
            QueuedMutation::CreateHabit(habit) => {
                match self.call(self.remote.create_habit(habit)).await {
                    Ok(_) | Err(SyncError::Remote(RemoteError::Conflict(_))) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            QueuedMutation::UpdateHabit(habit) => self
                .call(self.remote.update_habit(&habit.id, habit))
                .await
                .map(drop),
            QueuedMutation::DeleteHabit { id } => {
                ignore_not_found(self.call(self.remote.delete_habit(id)).await)
            }
            QueuedMutation::CreateCompletion { habit_id, date } => self
                .call(self.remote.create_completion(habit_id, *date))
                .await
                .map(drop),
            QueuedMutation::DeleteCompletion { habit_id, date } => {
                ignore_not_found(self.call(self.remote.delete_completion(habit_id, *date)).await)
            }
            QueuedMutation::LogSteps(record) => {
                // The local row is already max-merged; never upload below it.
                let latest = match self.store.get_row::<StepRecord>(&record.key()) {
                    Some(row) if !row.deleted => resolve_step_record(record, &row.data),
                    _ => record.clone(),
                };
                self.log_merged_steps(&latest).await.map(drop)
            }
        }
    }
}
