//! Store and retry configuration.

use std::time::Duration;

/// Configuration for opening a local store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fsync the log on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Whether to run pending schema migrations on open.
    pub run_migrations: bool,

    /// Retry schedule for sync queue items.
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            run_migrations: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync on every commit.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether to run migrations on open.
    #[must_use]
    pub fn run_migrations(mut self, value: bool) -> Self {
        self.run_migrations = value;
        self
    }

    /// Sets the queue retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Backoff schedule for failed sync queue items.
///
/// After the n-th failure an item waits `backoff[min(n - 1, len - 1)]`. Once
/// `retry_count` reaches `max_retries` the item is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the 1st, 2nd, ... failure; the last entry repeats.
    pub backoff: Vec<Duration>,
    /// Failures allowed before an item is dead-lettered.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(5 * 60),
                Duration::from_secs(30 * 60),
            ],
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default schedule and the given retry budget.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Replaces the backoff schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the delay before the next attempt after `retry_count` failures.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if self.backoff.is_empty() || retry_count == 0 {
            return Duration::ZERO;
        }
        let index = (retry_count as usize - 1).min(self.backoff.len() - 1);
        self.backoff[index]
    }
}
