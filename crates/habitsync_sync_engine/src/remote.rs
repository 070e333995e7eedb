//! The remote system of record.
//!
//! [`RemoteService`] is the contract the orchestrator drives; transport and
//! authentication live behind it. [`MemoryRemote`] implements it in memory
//! with call accounting and fault injection, for tests and demos.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use habitsync_protocol::{Badge, Completion, CompletionKey, Habit, StepKey, StepRecord, UserBadge};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failure reported by the remote service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service could not be reached.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The request was rejected as invalid.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The entity already exists or was changed concurrently.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service failed internally.
    #[error("server error {status}: {message}")]
    Server {
        /// Status code.
        status: u16,
        /// Error message.
        message: String,
    },
}

impl RemoteError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a server error.
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Returns true for failures caused by missing connectivity.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Narrows a completion listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionFilter {
    /// Only this habit.
    pub habit_id: Option<String>,
    /// First date, inclusive.
    pub start: Option<NaiveDate>,
    /// Last date, inclusive.
    pub end: Option<NaiveDate>,
}

impl CompletionFilter {
    /// Completions between two dates, inclusive.
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            habit_id: None,
            start: Some(start),
            end: Some(end),
        }
    }

    /// Returns true if `completion` passes the filter.
    pub fn matches(&self, completion: &Completion) -> bool {
        self.habit_id.as_ref().map_or(true, |h| *h == completion.habit_id)
            && self.start.map_or(true, |s| completion.date >= s)
            && self.end.map_or(true, |e| completion.date <= e)
    }
}

/// CRUD contract of the remote system of record, scoped to the
/// authenticated user.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Lists habits.
    async fn list_habits(&self, include_archived: bool) -> RemoteResult<Vec<Habit>>;

    /// Creates a habit under its client-generated id.
    async fn create_habit(&self, habit: &Habit) -> RemoteResult<Habit>;

    /// Replaces a habit.
    async fn update_habit(&self, id: &str, habit: &Habit) -> RemoteResult<Habit>;

    /// Deletes a habit and its completions.
    async fn delete_habit(&self, id: &str) -> RemoteResult<()>;

    /// Lists completions, optionally filtered.
    async fn list_completions(&self, filter: Option<&CompletionFilter>)
        -> RemoteResult<Vec<Completion>>;

    /// Marks a habit done on a date. Idempotent.
    async fn create_completion(&self, habit_id: &str, date: NaiveDate) -> RemoteResult<Completion>;

    /// Unmarks a habit on a date.
    async fn delete_completion(&self, habit_id: &str, date: NaiveDate) -> RemoteResult<()>;

    /// Lists step records between two dates, inclusive.
    async fn list_steps(&self, start: NaiveDate, end: NaiveDate) -> RemoteResult<Vec<StepRecord>>;

    /// Stores a day's step totals, replacing any previous record.
    async fn log_steps(&self, record: &StepRecord) -> RemoteResult<StepRecord>;

    /// Lists badge definitions.
    async fn list_badges(&self) -> RemoteResult<Vec<Badge>>;

    /// Lists badges the user has earned.
    async fn list_user_badges(&self) -> RemoteResult<Vec<UserBadge>>;
}

/// Methods of [`RemoteService`], for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteMethod {
    /// `list_habits`
    ListHabits,
    /// `create_habit`
    CreateHabit,
    /// `update_habit`
    UpdateHabit,
    /// `delete_habit`
    DeleteHabit,
    /// `list_completions`
    ListCompletions,
    /// `create_completion`
    CreateCompletion,
    /// `delete_completion`
    DeleteCompletion,
    /// `list_steps`
    ListSteps,
    /// `log_steps`
    LogSteps,
    /// `list_badges`
    ListBadges,
    /// `list_user_badges`
    ListUserBadges,
}

impl RemoteMethod {
    /// Returns true for methods that change remote state.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::CreateHabit
                | Self::UpdateHabit
                | Self::DeleteHabit
                | Self::CreateCompletion
                | Self::DeleteCompletion
                | Self::LogSteps
        )
    }
}

#[derive(Default)]
struct RemoteState {
    habits: BTreeMap<String, Habit>,
    completions: BTreeMap<CompletionKey, Completion>,
    steps: BTreeMap<StepKey, StepRecord>,
    badges: BTreeMap<String, Badge>,
    user_badges: BTreeMap<String, UserBadge>,
}

#[derive(Default)]
struct Faults {
    once: HashMap<RemoteMethod, VecDeque<RemoteError>>,
    always: HashMap<RemoteMethod, RemoteError>,
}

/// In-memory [`RemoteService`].
///
/// Behaves like a well-formed server: creates reject duplicates, updates and
/// deletes reject unknown ids, completions require a known habit and
/// `create_completion` is an idempotent upsert.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    calls: Mutex<BTreeMap<RemoteMethod, usize>>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    online: AtomicBool,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            calls: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(None),
            online: AtomicBool::new(true),
        }
    }

    // ----- seeding and inspection -----

    /// Stores a habit directly.
    pub fn seed_habit(&self, habit: Habit) {
        self.state.lock().habits.insert(habit.id.clone(), habit);
    }

    /// Stores a completion directly.
    pub fn seed_completion(&self, completion: Completion) {
        self.state.lock().completions.insert(completion.key(), completion);
    }

    /// Stores a step record directly.
    pub fn seed_steps(&self, record: StepRecord) {
        self.state.lock().steps.insert(record.key(), record);
    }

    /// Stores a badge definition directly.
    pub fn seed_badge(&self, badge: Badge) {
        self.state.lock().badges.insert(badge.id.clone(), badge);
    }

    /// Stores an earned badge directly.
    pub fn seed_user_badge(&self, badge: UserBadge) {
        self.state.lock().user_badges.insert(badge.id.clone(), badge);
    }

    /// Removes a habit directly, as another device would.
    pub fn remove_habit(&self, id: &str) -> Option<Habit> {
        self.state.lock().habits.remove(id)
    }

    /// All stored habits.
    pub fn habits(&self) -> Vec<Habit> {
        self.state.lock().habits.values().cloned().collect()
    }

    /// All stored completions.
    pub fn completions(&self) -> Vec<Completion> {
        self.state.lock().completions.values().cloned().collect()
    }

    /// All stored step records.
    pub fn steps(&self) -> Vec<StepRecord> {
        self.state.lock().steps.values().cloned().collect()
    }

    // ----- fault injection -----

    /// Switches reachability. While offline every call fails with
    /// [`RemoteError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Fails the next call of `method` with `error`. Queued errors are used
    /// in order.
    pub fn fail_next(&self, method: RemoteMethod, error: RemoteError) {
        self.faults.lock().once.entry(method).or_default().push_back(error);
    }

    /// Fails every call of `method` with `error` until cleared.
    pub fn fail_always(&self, method: RemoteMethod, error: RemoteError) {
        self.faults.lock().always.insert(method, error);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut faults = self.faults.lock();
        faults.once.clear();
        faults.always.clear();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    // ----- call accounting -----

    /// Calls made to `method`, failed ones included.
    pub fn calls(&self, method: RemoteMethod) -> usize {
        self.calls.lock().get(&method).copied().unwrap_or(0)
    }

    /// Calls made to state-changing methods.
    pub fn mutating_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m.is_mutating())
            .map(|(_, n)| n)
            .sum()
    }

    /// Calls made to any method.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Resets call counters.
    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    async fn enter(&self, method: RemoteMethod) -> RemoteResult<()> {
        *self.calls.lock().entry(method).or_insert(0) += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::unavailable("network unreachable"));
        }

        let mut faults = self.faults.lock();
        if let Some(error) = faults.once.get_mut(&method).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(error) = faults.always.get(&method) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteService for MemoryRemote {
    async fn list_habits(&self, include_archived: bool) -> RemoteResult<Vec<Habit>> {
        self.enter(RemoteMethod::ListHabits).await?;
        Ok(self
            .state
            .lock()
            .habits
            .values()
            .filter(|h| include_archived || !h.archived)
            .cloned()
            .collect())
    }

    async fn create_habit(&self, habit: &Habit) -> RemoteResult<Habit> {
        self.enter(RemoteMethod::CreateHabit).await?;
        if habit.name.trim().is_empty() {
            return Err(RemoteError::validation("habit name must not be empty"));
        }
        let mut state = self.state.lock();
        if state.habits.contains_key(&habit.id) {
            return Err(RemoteError::Conflict(format!("habit {} exists", habit.id)));
        }
        state.habits.insert(habit.id.clone(), habit.clone());
        Ok(habit.clone())
    }

    async fn update_habit(&self, id: &str, habit: &Habit) -> RemoteResult<Habit> {
        self.enter(RemoteMethod::UpdateHabit).await?;
        if habit.name.trim().is_empty() {
            return Err(RemoteError::validation("habit name must not be empty"));
        }
        let mut state = self.state.lock();
        match state.habits.get_mut(id) {
            Some(stored) => {
                *stored = habit.clone();
                Ok(habit.clone())
            }
            None => Err(RemoteError::NotFound(format!("habit {id}"))),
        }
    }

    async fn delete_habit(&self, id: &str) -> RemoteResult<()> {
        self.enter(RemoteMethod::DeleteHabit).await?;
        let mut state = self.state.lock();
        if state.habits.remove(id).is_none() {
            return Err(RemoteError::NotFound(format!("habit {id}")));
        }
        state.completions.retain(|key, _| key.habit_id != id);
        Ok(())
    }

    async fn list_completions(
        &self,
        filter: Option<&CompletionFilter>,
    ) -> RemoteResult<Vec<Completion>> {
        self.enter(RemoteMethod::ListCompletions).await?;
        Ok(self
            .state
            .lock()
            .completions
            .values()
            .filter(|c| filter.map_or(true, |f| f.matches(c)))
            .cloned()
            .collect())
    }

    async fn create_completion(&self, habit_id: &str, date: NaiveDate) -> RemoteResult<Completion> {
        self.enter(RemoteMethod::CreateCompletion).await?;
        let mut state = self.state.lock();
        if !state.habits.contains_key(habit_id) {
            return Err(RemoteError::validation(format!("unknown habit {habit_id}")));
        }
        let completion = state
            .completions
            .entry(CompletionKey {
                habit_id: habit_id.to_string(),
                date,
            })
            .or_insert_with(|| Completion::new(habit_id, date, Utc::now()));
        Ok(completion.clone())
    }

    async fn delete_completion(&self, habit_id: &str, date: NaiveDate) -> RemoteResult<()> {
        self.enter(RemoteMethod::DeleteCompletion).await?;
        let key = CompletionKey {
            habit_id: habit_id.to_string(),
            date,
        };
        match self.state.lock().completions.remove(&key) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(format!("completion {key}"))),
        }
    }

    async fn list_steps(&self, start: NaiveDate, end: NaiveDate) -> RemoteResult<Vec<StepRecord>> {
        self.enter(RemoteMethod::ListSteps).await?;
        Ok(self
            .state
            .lock()
            .steps
            .values()
            .filter(|r| r.date >= start && r.date <= end)
            .cloned()
            .collect())
    }

    async fn log_steps(&self, record: &StepRecord) -> RemoteResult<StepRecord> {
        self.enter(RemoteMethod::LogSteps).await?;
        self.state.lock().steps.insert(record.key(), record.clone());
        Ok(record.clone())
    }

    async fn list_badges(&self) -> RemoteResult<Vec<Badge>> {
        self.enter(RemoteMethod::ListBadges).await?;
        Ok(self.state.lock().badges.values().cloned().collect())
    }

    async fn list_user_badges(&self) -> RemoteResult<Vec<UserBadge>> {
        self.enter(RemoteMethod::ListUserBadges).await?;
        Ok(self.state.lock().user_badges.values().cloned().collect())
    }
}
