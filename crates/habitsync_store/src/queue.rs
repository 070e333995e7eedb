//! Durable retry queue of remote mutations.
//!
//! Items live in the store's queue table and are written through the same
//! log as entity rows, so an item and the row change that produced it can
//! commit in one transaction.
//!
//! An item is eligible for replay while `retry_count < max_retries` and its
//! `next_retry_at` has passed. Each failure bumps `retry_count` and pushes
//! `next_retry_at` out along the store's [`RetryPolicy`]. Items that run out
//! of retries stay in the table (dead letters) until [`SyncQueue::retry_failed`]
//! resets them.

use crate::config::RetryPolicy;
use crate::error::{StoreError, StoreResult};
use crate::store::LocalStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use habitsync_protocol::{EntityType, Operation, QueuedMutation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A queued remote mutation with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Monotonic id.
    pub id: u64,
    /// Target entity type.
    pub entity_type: EntityType,
    /// Target entity key, rendered as text.
    pub entity_id: Option<String>,
    /// Remote operation.
    pub operation: Operation,
    /// The mutation to replay.
    pub payload: QueuedMutation,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Failed attempts allowed before dead-lettering.
    pub max_retries: u32,
    /// Earliest instant of the next attempt.
    pub next_retry_at: DateTime<Utc>,
    /// Message of the last failure.
    pub error_message: Option<String>,
    /// Enqueue instant.
    pub created_at: DateTime<Utc>,
    /// Last change instant.
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Creates a fresh item, due immediately.
    pub fn new(id: u64, payload: QueuedMutation, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            entity_type: payload.entity_type(),
            entity_id: payload.entity_id(),
            operation: payload.operation(),
            payload,
            retry_count: 0,
            max_retries,
            next_retry_at: now,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the retry budget is spent.
    #[must_use]
    pub fn is_dead_lettered(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Returns true if the item should be attempted at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_dead_lettered() && self.next_retry_at <= now
    }

    /// Records a failed attempt at `now` and schedules the next one.
    pub fn record_failure(&mut self, error: impl Into<String>, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        let delay = ChronoDuration::from_std(policy.delay_for(self.retry_count))
            .unwrap_or(ChronoDuration::MAX);
        self.next_retry_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.error_message = Some(error.into());
        self.updated_at = now;
    }

    /// Clears the retry budget so the item is due again at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.retry_count = 0;
        self.next_retry_at = now;
        self.updated_at = now;
    }
}

/// Handle over the store's sync queue.
///
/// Obtained from [`LocalStore::queue`]. Every mutating call commits its own
/// transaction; use [`crate::Transaction::enqueue`] to enqueue together with
/// a row change.
#[derive(Clone, Copy)]
pub struct SyncQueue<'a> {
    store: &'a LocalStore,
}

impl<'a> SyncQueue<'a> {
    pub(crate) fn new(store: &'a LocalStore) -> Self {
        Self { store }
    }

    /// Appends a mutation, due now. Returns the item id.
    pub fn add(&self, mutation: QueuedMutation) -> StoreResult<u64> {
        self.add_at(mutation, Utc::now())
    }

    /// Appends a mutation, due at `now`.
    pub fn add_at(&self, mutation: QueuedMutation, now: DateTime<Utc>) -> StoreResult<u64> {
        self.store.transaction(|txn| Ok(txn.enqueue_at(mutation, now)))
    }

    /// Items due now, oldest first.
    pub fn get_pending(&self) -> Vec<QueueItem> {
        self.get_pending_at(Utc::now())
    }

    /// Items due at `now`, ordered by `created_at` then id.
    pub fn get_pending_at(&self, now: DateTime<Utc>) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self
            .store
            .read(|tables| tables.queue.values().filter(|i| i.is_due(now)).cloned().collect());
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Acknowledges an item. Returns false if it was already gone.
    pub fn mark_succeeded(&self, id: u64) -> StoreResult<bool> {
        self.store.transaction(|txn| Ok(txn.remove_queue_item(id)))
    }

    /// Records a failed attempt now.
    pub fn mark_failed(&self, id: u64, error: &str) -> StoreResult<QueueItem> {
        self.mark_failed_at(id, error, Utc::now())
    }

    /// Records a failed attempt at `now` and returns the updated item.
    ///
    /// # Errors
    ///
    /// [`StoreError::QueueItemNotFound`] if no item has this id.
    pub fn mark_failed_at(&self, id: u64, error: &str, now: DateTime<Utc>) -> StoreResult<QueueItem> {
        let policy = self.store.config().retry.clone();
        let item = self.store.transaction(|txn| {
            let mut item = txn
                .queue_item(id)
                .cloned()
                .ok_or(StoreError::QueueItemNotFound(id))?;
            item.record_failure(error, &policy, now);
            txn.put_queue_item(item.clone());
            Ok(item)
        })?;

        if item.is_dead_lettered() {
            warn!(
                id,
                entity_type = %item.entity_type,
                retries = item.retry_count,
                error,
                "sync queue item dead-lettered"
            );
        } else {
            debug!(id, retries = item.retry_count, next_retry_at = %item.next_retry_at, "sync queue item failed");
        }
        Ok(item)
    }

    /// Items that exhausted their retries, oldest first.
    pub fn get_failed_items(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self.store.read(|tables| {
            tables
                .queue
                .values()
                .filter(|i| i.is_dead_lettered())
                .cloned()
                .collect()
        });
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Resets every dead-lettered item. Returns how many were reset.
    pub fn retry_failed(&self) -> StoreResult<usize> {
        self.retry_failed_at(Utc::now())
    }

    /// Resets every dead-lettered item so it is due at `now`.
    pub fn retry_failed_at(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.store.transaction(|txn| {
            let failed: Vec<QueueItem> = txn
                .queue_items()
                .filter(|i| i.is_dead_lettered())
                .cloned()
                .collect();
            let count = failed.len();
            for mut item in failed {
                item.reset(now);
                txn.put_queue_item(item);
            }
            Ok(count)
        })
    }

    /// Returns an item by id.
    pub fn get(&self, id: u64) -> Option<QueueItem> {
        self.store.read(|tables| tables.queue.get(&id).cloned())
    }

    /// All items in id order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.store.read(|tables| tables.queue.values().cloned().collect())
    }

    /// Number of items, dead letters included.
    pub fn len(&self) -> usize {
        self.store.read(|tables| tables.queue.len())
    }

    /// Returns true if the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
