//! Cached entity types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sync state of a locally cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// The remote holds the same value as the local row.
    Synced,
    /// A local mutation has not been confirmed remotely yet.
    Pending,
    /// The last push attempt for this row failed.
    Error,
}

impl SyncStatus {
    /// Returns the lowercase name used in logs and CLI output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }

    /// Returns true if the row still has to be pushed.
    #[must_use]
    pub const fn needs_push(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// [`Habit`]
    Habit,
    /// [`Completion`]
    Completion,
    /// [`StepRecord`]
    StepRecord,
    /// [`Badge`]
    Badge,
    /// [`UserBadge`]
    UserBadge,
}

impl EntityType {
    /// All entity types, in push order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Habit,
        EntityType::Completion,
        EntityType::StepRecord,
        EntityType::Badge,
        EntityType::UserBadge,
    ];

    /// Returns the table name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Habit => "habits",
            EntityType::Completion => "completions",
            EntityType::StepRecord => "step_records",
            EntityType::Badge => "badges",
            EntityType::UserBadge => "user_badges",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote operation a queued mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create (or idempotent upsert).
    Create,
    /// Update an existing entity.
    Update,
    /// Delete an entity.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// A habit the user tracks.
///
/// Ids are generated on the device so a habit created offline keeps its
/// identity once the remote accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Habit {
    /// Client-generated UUID.
    pub id: String,
    /// Owner.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Optional free text.
    pub description: Option<String>,
    /// Optional icon identifier.
    pub icon: Option<String>,
    /// Optional color (hex).
    pub color: Option<String>,
    /// How many days per week the user aims for.
    pub target_per_week: u8,
    /// Archived habits are hidden but kept.
    pub archived: bool,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last edit instant; drives last-writer-wins.
    pub updated_at: DateTime<Utc>,
}

impl Habit {
    /// Creates a daily habit with a fresh id.
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            description: None,
            icon: None,
            color: None,
            target_per_week: 7,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bumps `updated_at` after an edit.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Natural key of a [`Completion`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompletionKey {
    /// Habit the completion belongs to.
    pub habit_id: String,
    /// Calendar date.
    pub date: NaiveDate,
}

impl fmt::Display for CompletionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.habit_id, self.date)
    }
}

/// A habit marked done on a date. At most one per `(habit_id, date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Habit the completion belongs to.
    pub habit_id: String,
    /// Calendar date the habit was done on.
    pub date: NaiveDate,
    /// When it was marked done.
    pub completed_at: DateTime<Utc>,
}

impl Completion {
    /// Creates a completion.
    pub fn new(habit_id: impl Into<String>, date: NaiveDate, completed_at: DateTime<Utc>) -> Self {
        Self {
            habit_id: habit_id.into(),
            date,
            completed_at,
        }
    }

    /// Returns the natural key.
    #[must_use]
    pub fn key(&self) -> CompletionKey {
        CompletionKey {
            habit_id: self.habit_id.clone(),
            date: self.date,
        }
    }
}

/// Natural key of a [`StepRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    /// Owner.
    pub user_id: String,
    /// Calendar date.
    pub date: NaiveDate,
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.date)
    }
}

/// Daily pedometer totals. At most one per `(user_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Owner.
    pub user_id: String,
    /// Calendar date.
    pub date: NaiveDate,
    /// Step count.
    pub steps: u32,
    /// Distance in meters.
    pub distance: f64,
    /// Active calories.
    pub calories: f64,
}

impl StepRecord {
    /// Creates a step record.
    pub fn new(
        user_id: impl Into<String>,
        date: NaiveDate,
        steps: u32,
        distance: f64,
        calories: f64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            date,
            steps,
            distance,
            calories,
        }
    }

    /// Returns the natural key.
    #[must_use]
    pub fn key(&self) -> StepKey {
        StepKey {
            user_id: self.user_id.clone(),
            date: self.date,
        }
    }
}

/// A badge definition. Server-owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    /// Badge id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What earns it.
    pub description: String,
    /// Icon identifier.
    pub icon: Option<String>,
    /// Threshold (streak length, step count, ...) the badge is awarded at.
    pub requirement: u32,
}

/// A badge earned by a user. Server-owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBadge {
    /// Award id.
    pub id: String,
    /// Owner.
    pub user_id: String,
    /// Awarded badge.
    pub badge_id: String,
    /// When it was earned.
    pub earned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_habits_get_distinct_ids() {
        let now = Utc::now();
        let a = Habit::new("u1", "Read", now);
        let b = Habit::new("u1", "Read", now);
        assert_ne!(a.id, b.id);
        assert_eq!(a.created_at, a.updated_at);
    }

    #[test]
    fn keys_order_by_owner_then_date() {
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let a = CompletionKey {
            habit_id: "h1".into(),
            date: d2,
        };
        let b = CompletionKey {
            habit_id: "h2".into(),
            date: d1,
        };
        assert!(a < b);
        assert_eq!(a.to_string(), "h1:2024-03-02");
    }

    #[test]
    fn status_needs_push() {
        assert!(!SyncStatus::Synced.needs_push());
        assert!(SyncStatus::Pending.needs_push());
        assert!(SyncStatus::Error.needs_push());
        assert_eq!(
            serde_json::to_string(&SyncStatus::Pending).unwrap(),
            "\"pending\""
        );
    }
}
