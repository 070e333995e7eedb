//! In-memory tables and the mutations that change them.
//!
//! The log stores [`Mutation`]s; replaying them in order rebuilds
//! [`Tables`]. Applying a mutation returns its inverse, which is how a
//! transaction rolls back.

use crate::queue::QueueItem;
use crate::row::Row;
use habitsync_protocol::{
    Badge, Completion, CompletionKey, EntityType, Habit, StepKey, StepRecord, UserBadge,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};

/// A single logged change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    /// Insert or replace a habit row.
    PutHabit(Row<Habit>),
    /// Remove a habit row.
    RemoveHabit(String),
    /// Insert or replace a completion row.
    PutCompletion(Row<Completion>),
    /// Remove a completion row.
    RemoveCompletion(CompletionKey),
    /// Insert or replace a step record row.
    PutStepRecord(Row<StepRecord>),
    /// Remove a step record row.
    RemoveStepRecord(StepKey),
    /// Insert or replace a badge row.
    PutBadge(Row<Badge>),
    /// Remove a badge row.
    RemoveBadge(String),
    /// Insert or replace a user badge row.
    PutUserBadge(Row<UserBadge>),
    /// Remove a user badge row.
    RemoveUserBadge(String),
    /// Insert or replace a sync queue item.
    PutQueueItem(QueueItem),
    /// Remove (acknowledge) a sync queue item.
    RemoveQueueItem(u64),
    /// Set a metadata value.
    SetMeta {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// Remove a metadata value.
    RemoveMeta(String),
    /// Set the id the next queue item receives.
    SetQueueSeq(u64),
}

/// An entity type with its own table in the local store.
pub trait Entity: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Natural key.
    type Key: Ord + Clone + Debug + Display + Send + Sync;

    /// Table tag.
    const TYPE: EntityType;

    /// Returns the natural key of this entity.
    fn key(&self) -> Self::Key;

    /// Returns this entity's table.
    fn table(tables: &Tables) -> &BTreeMap<Self::Key, Row<Self>>;

    /// Returns this entity's table for writing.
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Row<Self>>;

    /// Wraps a row in the matching put mutation.
    fn put_mutation(row: Row<Self>) -> Mutation;

    /// Wraps a key in the matching remove mutation.
    fn remove_mutation(key: Self::Key) -> Mutation;
}

macro_rules! entity_table {
    ($entity:ty, $key:ty, $tag:expr, $field:ident, $put:ident, $remove:ident, |$e:ident| $key_expr:expr) => {
        impl Entity for $entity {
            type Key = $key;
            const TYPE: EntityType = $tag;

            fn key(&self) -> Self::Key {
                let $e = self;
                $key_expr
            }

            fn table(tables: &Tables) -> &BTreeMap<Self::Key, Row<Self>> {
                &tables.$field
            }

            fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Row<Self>> {
                &mut tables.$field
            }

            fn put_mutation(row: Row<Self>) -> Mutation {
                Mutation::$put(row)
            }

            fn remove_mutation(key: Self::Key) -> Mutation {
                Mutation::$remove(key)
            }
        }
    };
}

entity_table!(Habit, String, EntityType::Habit, habits, PutHabit, RemoveHabit, |e| e.id.clone());
entity_table!(
    Completion,
    CompletionKey,
    EntityType::Completion,
    completions,
    PutCompletion,
    RemoveCompletion,
    |e| e.key()
);
entity_table!(
    StepRecord,
    StepKey,
    EntityType::StepRecord,
    step_records,
    PutStepRecord,
    RemoveStepRecord,
    |e| e.key()
);
entity_table!(Badge, String, EntityType::Badge, badges, PutBadge, RemoveBadge, |e| e.id.clone());
entity_table!(
    UserBadge,
    String,
    EntityType::UserBadge,
    user_badges,
    PutUserBadge,
    RemoveUserBadge,
    |e| e.id.clone()
);

/// The full local state: one table per entity type, the sync queue and the
/// metadata table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    pub(crate) habits: BTreeMap<String, Row<Habit>>,
    pub(crate) completions: BTreeMap<CompletionKey, Row<Completion>>,
    pub(crate) step_records: BTreeMap<StepKey, Row<StepRecord>>,
    pub(crate) badges: BTreeMap<String, Row<Badge>>,
    pub(crate) user_badges: BTreeMap<String, Row<UserBadge>>,
    pub(crate) queue: BTreeMap<u64, QueueItem>,
    pub(crate) meta: BTreeMap<String, String>,
    pub(crate) next_queue_id: u64,
}

impl Tables {
    /// Applies a mutation and returns the mutation that undoes it.
    pub fn apply(&mut self, mutation: Mutation) -> Mutation {
        match mutation {
            Mutation::PutHabit(row) => self.put_row(row),
            Mutation::RemoveHabit(key) => self.remove_row::<Habit>(key),
            Mutation::PutCompletion(row) => self.put_row(row),
            Mutation::RemoveCompletion(key) => self.remove_row::<Completion>(key),
            Mutation::PutStepRecord(row) => self.put_row(row),
            Mutation::RemoveStepRecord(key) => self.remove_row::<StepRecord>(key),
            Mutation::PutBadge(row) => self.put_row(row),
            Mutation::RemoveBadge(key) => self.remove_row::<Badge>(key),
            Mutation::PutUserBadge(row) => self.put_row(row),
            Mutation::RemoveUserBadge(key) => self.remove_row::<UserBadge>(key),
            Mutation::PutQueueItem(item) => {
                let id = item.id;
                match self.queue.insert(id, item) {
                    Some(previous) => Mutation::PutQueueItem(previous),
                    None => Mutation::RemoveQueueItem(id),
                }
            }
            Mutation::RemoveQueueItem(id) => match self.queue.remove(&id) {
                Some(previous) => Mutation::PutQueueItem(previous),
                None => Mutation::RemoveQueueItem(id),
            },
            Mutation::SetMeta { key, value } => match self.meta.insert(key.clone(), value) {
                Some(previous) => Mutation::SetMeta {
                    key,
                    value: previous,
                },
                None => Mutation::RemoveMeta(key),
            },
            Mutation::RemoveMeta(key) => match self.meta.remove(&key) {
                Some(previous) => Mutation::SetMeta {
                    key,
                    value: previous,
                },
                None => Mutation::RemoveMeta(key),
            },
            Mutation::SetQueueSeq(next) => {
                Mutation::SetQueueSeq(std::mem::replace(&mut self.next_queue_id, next))
            }
        }
    }

    fn put_row<E: Entity>(&mut self, row: Row<E>) -> Mutation {
        let key = row.data.key();
        match E::table_mut(self).insert(key.clone(), row) {
            Some(previous) => E::put_mutation(previous),
            None => E::remove_mutation(key),
        }
    }

    fn remove_row<E: Entity>(&mut self, key: E::Key) -> Mutation {
        match E::table_mut(self).remove(&key) {
            Some(previous) => E::put_mutation(previous),
            None => E::remove_mutation(key),
        }
    }

    /// Returns put mutations that rebuild this state from empty tables.
    pub fn snapshot(&self) -> Vec<Mutation> {
        let mut mutations = Vec::with_capacity(self.row_count() + self.queue.len() + self.meta.len());
        mutations.extend(self.habits.values().cloned().map(Mutation::PutHabit));
        mutations.extend(self.completions.values().cloned().map(Mutation::PutCompletion));
        mutations.extend(self.step_records.values().cloned().map(Mutation::PutStepRecord));
        mutations.extend(self.badges.values().cloned().map(Mutation::PutBadge));
        mutations.extend(self.user_badges.values().cloned().map(Mutation::PutUserBadge));
        mutations.extend(self.queue.values().cloned().map(Mutation::PutQueueItem));
        mutations.extend(self.meta.iter().map(|(key, value)| Mutation::SetMeta {
            key: key.clone(),
            value: value.clone(),
        }));
        mutations.push(Mutation::SetQueueSeq(self.next_queue_id));
        mutations
    }

    /// Number of entity rows across all tables, tombstones included.
    pub fn row_count(&self) -> usize {
        self.habits.len()
            + self.completions.len()
            + self.step_records.len()
            + self.badges.len()
            + self.user_badges.len()
    }

    /// Id the next enqueued item receives. Ids start at 1.
    pub(crate) fn next_queue_id(&self) -> u64 {
        self.next_queue_id.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn apply_returns_inverse() {
        let mut tables = Tables::default();
        let habit = Habit::new("u1", "Walk", Utc::now());

        let undo_insert = tables.apply(Mutation::PutHabit(Row::pending(habit.clone())));
        assert_eq!(undo_insert, Mutation::RemoveHabit(habit.id.clone()));

        let mut renamed = habit.clone();
        renamed.name = "Run".into();
        let undo_update = tables.apply(Mutation::PutHabit(Row::pending(renamed)));
        assert_eq!(undo_update, Mutation::PutHabit(Row::pending(habit.clone())));

        tables.apply(undo_update);
        assert_eq!(tables.habits[&habit.id].data.name, "Walk");
        tables.apply(undo_insert);
        assert!(tables.habits.is_empty());
    }

    #[test]
    fn meta_inverse_restores_previous_value() {
        let mut tables = Tables::default();
        tables.apply(Mutation::SetMeta {
            key: "k".into(),
            value: "1".into(),
        });
        let undo = tables.apply(Mutation::SetMeta {
            key: "k".into(),
            value: "2".into(),
        });
        tables.apply(undo);
        assert_eq!(tables.meta["k"], "1");
    }

    #[test]
    fn snapshot_rebuilds_identical_state() {
        let mut tables = Tables::default();
        let now = Utc::now();
        tables.apply(Mutation::PutHabit(Row::synced(Habit::new("u1", "Read", now), now)));
        tables.apply(Mutation::SetMeta {
            key: "schema_version".into(),
            value: "2".into(),
        });

        let mut rebuilt = Tables::default();
        for mutation in tables.snapshot() {
            rebuilt.apply(mutation);
        }
        assert_eq!(rebuilt, tables);
    }
}
