//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync passes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// User whose data is synchronized.
    pub user_id: String,
    /// Upper bound for each remote call.
    pub request_timeout: Duration,
    /// Days of completions and step records pulled, ending today.
    pub step_window_days: u32,
    /// Interval for background sync; `None` disables the timer.
    pub sync_interval: Option<Duration>,
    /// Whether habit pulls include archived habits.
    pub include_archived: bool,
}

impl SyncConfig {
    /// Creates a configuration for a user with default values.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            request_timeout: Duration::from_secs(30),
            step_window_days: 30,
            sync_interval: None,
            include_archived: true,
        }
    }

    /// Sets the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the pull window in days (at least 1).
    pub fn with_step_window_days(mut self, days: u32) -> Self {
        self.step_window_days = days.max(1);
        self
    }

    /// Sets the background sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets whether archived habits are pulled.
    pub fn with_include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::new("u1");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.step_window_days, 30);
        assert!(config.sync_interval.is_none());
        assert!(config.include_archived);
    }

    #[test]
    fn window_is_at_least_one_day() {
        assert_eq!(SyncConfig::new("u1").with_step_window_days(0).step_window_days, 1);
    }
}
