//! Typed payloads for sync queue items.

use crate::entity::{CompletionKey, EntityType, Habit, Operation, StepRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A remote mutation waiting in the sync queue.
///
/// Each variant fixes its `(entity_type, operation)` pair and carries a
/// strongly-typed payload. Bytes only exist at the persistence boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum QueuedMutation {
    /// Create a habit remotely.
    CreateHabit(Habit),
    /// Overwrite a habit remotely.
    UpdateHabit(Habit),
    /// Delete a habit remotely.
    DeleteHabit {
        /// Habit id.
        id: String,
    },
    /// Mark a habit done on a date (idempotent upsert).
    CreateCompletion {
        /// Habit id.
        habit_id: String,
        /// Calendar date.
        date: NaiveDate,
    },
    /// Unmark a habit on a date.
    DeleteCompletion {
        /// Habit id.
        habit_id: String,
        /// Calendar date.
        date: NaiveDate,
    },
    /// Upload daily step totals.
    LogSteps(StepRecord),
}

impl QueuedMutation {
    /// Returns the entity type this mutation targets.
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::CreateHabit(_) | Self::UpdateHabit(_) | Self::DeleteHabit { .. } => {
                EntityType::Habit
            }
            Self::CreateCompletion { .. } | Self::DeleteCompletion { .. } => EntityType::Completion,
            Self::LogSteps(_) => EntityType::StepRecord,
        }
    }

    /// Returns the remote operation.
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::CreateHabit(_) | Self::CreateCompletion { .. } | Self::LogSteps(_) => {
                Operation::Create
            }
            Self::UpdateHabit(_) => Operation::Update,
            Self::DeleteHabit { .. } | Self::DeleteCompletion { .. } => Operation::Delete,
        }
    }

    /// Returns the id of the targeted entity, rendered as text.
    ///
    /// Composite keys render as `owner:date`.
    #[must_use]
    pub fn entity_id(&self) -> Option<String> {
        match self {
            Self::CreateHabit(habit) | Self::UpdateHabit(habit) => Some(habit.id.clone()),
            Self::DeleteHabit { id } => Some(id.clone()),
            Self::CreateCompletion { habit_id, date } | Self::DeleteCompletion { habit_id, date } => {
                Some(
                    CompletionKey {
                        habit_id: habit_id.clone(),
                        date: *date,
                    }
                    .to_string(),
                )
            }
            Self::LogSteps(record) => Some(record.key().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn variants_fix_type_and_operation() {
        let habit = Habit::new("u1", "Stretch", Utc::now());
        let create = QueuedMutation::CreateHabit(habit.clone());
        assert_eq!(create.entity_type(), EntityType::Habit);
        assert_eq!(create.operation(), Operation::Create);
        assert_eq!(create.entity_id(), Some(habit.id.clone()));

        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let unmark = QueuedMutation::DeleteCompletion {
            habit_id: "H1".into(),
            date,
        };
        assert_eq!(unmark.entity_type(), EntityType::Completion);
        assert_eq!(unmark.operation(), Operation::Delete);
        assert_eq!(unmark.entity_id().as_deref(), Some("H1:2024-03-01"));
    }

    #[test]
    fn serialized_form_is_tagged() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mutation = QueuedMutation::CreateCompletion {
            habit_id: "H1".into(),
            date,
        };
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["kind"], "create_completion");
        assert_eq!(json["payload"]["habit_id"], "H1");
    }
}
