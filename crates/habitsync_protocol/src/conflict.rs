//! Conflict resolution between local and remote versions of an entity.
//!
//! Every function here is pure and deterministic: the same inputs always
//! produce the same output, regardless of argument order where the policy is
//! symmetric.
//!
//! | Entity | Policy |
//! |---|---|
//! | [`Habit`] | last writer wins on `updated_at`, remote wins ties |
//! | [`Completion`] | presence union, earlier `completed_at` kept |
//! | [`StepRecord`] | per-field maximum |

use crate::entity::{Completion, CompletionKey, Habit, StepRecord};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Picks the most recently edited habit. The remote version wins ties.
#[must_use]
pub fn resolve_habit(local: &Habit, remote: &Habit) -> Habit {
    if local.updated_at > remote.updated_at {
        local.clone()
    } else {
        remote.clone()
    }
}

/// Merges two completions of the same habit and date.
///
/// Both sides say the habit was done; the first real-world mark is kept.
/// Equal instants resolve to the remote copy.
#[must_use]
pub fn resolve_completion(local: &Completion, remote: &Completion) -> Completion {
    if local.completed_at < remote.completed_at {
        local.clone()
    } else {
        remote.clone()
    }
}

/// Merges two step records of the same day, field by field.
///
/// Pedometers undercount far more often than they overcount, so the larger
/// reading of each field is kept.
#[must_use]
pub fn resolve_step_record(local: &StepRecord, remote: &StepRecord) -> StepRecord {
    StepRecord {
        user_id: remote.user_id.clone(),
        date: remote.date,
        steps: local.steps.max(remote.steps),
        distance: local.distance.max(remote.distance),
        calories: local.calories.max(remote.calories),
    }
}

/// Unions two completion sets keyed by `(habit_id, date)`.
///
/// Overlapping keys go through [`resolve_completion`]. The result is ordered
/// by key and holds each key exactly once.
#[must_use]
pub fn merge_completions(local: &[Completion], remote: &[Completion]) -> Vec<Completion> {
    let mut merged: BTreeMap<CompletionKey, Completion> = BTreeMap::new();
    for completion in local {
        insert_completion(&mut merged, completion, false);
    }
    for completion in remote {
        insert_completion(&mut merged, completion, true);
    }
    merged.into_values().collect()
}

fn insert_completion(
    merged: &mut BTreeMap<CompletionKey, Completion>,
    completion: &Completion,
    is_remote: bool,
) {
    let resolved = match merged.get(&completion.key()) {
        Some(existing) if is_remote => resolve_completion(existing, completion),
        Some(existing) => resolve_completion(completion, existing),
        None => completion.clone(),
    };
    merged.insert(completion.key(), resolved);
}

/// Unions two step record sets keyed by date.
///
/// Overlapping dates go through [`resolve_step_record`]. The result is
/// ordered by date.
#[must_use]
pub fn merge_step_records(local: &[StepRecord], remote: &[StepRecord]) -> Vec<StepRecord> {
    let mut merged: BTreeMap<NaiveDate, StepRecord> = BTreeMap::new();
    for record in local.iter().chain(remote) {
        let resolved = match merged.get(&record.date) {
            Some(existing) => resolve_step_record(existing, record),
            None => record.clone(),
        };
        merged.insert(record.date, resolved);
    }
    merged.into_values().collect()
}
