//! Connectivity observation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure of a connectivity probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("connectivity probe failed: {0}")]
pub struct ProbeError(pub String);

/// Asks the platform whether the device is online.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Returns the current connectivity.
    async fn probe(&self) -> Result<bool, ProbeError>;
}

type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;
type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    status: BTreeMap<u64, StatusCallback>,
    reconnection: BTreeMap<u64, ReconnectCallback>,
}

struct MonitorInner {
    connected: AtomicBool,
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
    probe: Option<Arc<dyn ConnectivityProbe>>,
}

/// Tracks connectivity and notifies subscribers of changes.
///
/// Starts out connected. Platform events are fed through
/// [`NetworkMonitor::set_connected`]; [`NetworkMonitor::refresh`] asks the
/// optional probe. Clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    /// Creates a monitor without a probe.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a monitor backed by a probe.
    pub fn with_probe(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self::build(Some(probe))
    }

    fn build(probe: Option<Arc<dyn ConnectivityProbe>>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                connected: AtomicBool::new(true),
                listeners: Mutex::new(Listeners::default()),
                next_id: AtomicU64::new(1),
                probe,
            }),
        }
    }

    /// Returns the last known connectivity.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Records a connectivity change.
    ///
    /// Status listeners fire on every change; reconnection listeners fire
    /// only on offline to online.
    pub fn set_connected(&self, connected: bool) {
        let previous = self.inner.connected.swap(connected, Ordering::SeqCst);
        if previous == connected {
            return;
        }

        if connected {
            info!("network connectivity restored");
        } else {
            info!("network connectivity lost");
        }

        // Snapshot the callbacks so listeners may subscribe or unsubscribe
        // from inside a callback.
        let (status, reconnection): (Vec<StatusCallback>, Vec<ReconnectCallback>) = {
            let listeners = self.inner.listeners.lock();
            (
                listeners.status.values().cloned().collect(),
                if connected {
                    listeners.reconnection.values().cloned().collect()
                } else {
                    Vec::new()
                },
            )
        };

        for callback in status {
            callback(connected);
        }
        for callback in reconnection {
            callback();
        }
    }

    /// Re-checks connectivity through the probe and returns the result.
    ///
    /// A failing probe is treated as connected: the sync pass then finds out
    /// for itself.
    pub async fn refresh(&self) -> bool {
        let Some(probe) = self.inner.probe.clone() else {
            return self.is_connected();
        };
        let connected = match probe.probe().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(error = %e, "connectivity probe failed, assuming connected");
                true
            }
        };
        self.set_connected(connected);
        connected
    }

    /// Calls `callback` with the new state on every connectivity change.
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.listeners.lock().status.insert(id, Arc::new(callback));
        Subscription::new(&self.inner, id)
    }

    /// Calls `callback` on every offline to online transition.
    pub fn on_reconnection<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .listeners
            .lock()
            .reconnection
            .insert(id, Arc::new(callback));
        Subscription::new(&self.inner, id)
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        let listeners = self.inner.listeners.lock();
        listeners.status.len() + listeners.reconnection.len()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Handle to a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    monitor: Weak<MonitorInner>,
    id: u64,
}

impl Subscription {
    fn new(inner: &Arc<MonitorInner>, id: u64) -> Self {
        Self {
            monitor: Arc::downgrade(inner),
            id,
        }
    }

    /// Removes the listener.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            let mut listeners = inner.listeners.lock();
            listeners.status.remove(&self.id);
            listeners.reconnection.remove(&self.id);
            debug!(id = self.id, "network listener removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedProbe(Result<bool, ProbeError>);

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn probe(&self) -> Result<bool, ProbeError> {
            self.0.clone()
        }
    }

    #[test]
    fn starts_connected() {
        assert!(NetworkMonitor::new().is_connected());
    }

    #[test]
    fn reconnection_fires_only_on_false_to_true() {
        let monitor = NetworkMonitor::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _sub = monitor.on_reconnection(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_connected(true);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        monitor.set_connected(false);
        monitor.set_connected(false);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        monitor.set_connected(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_listener_sees_every_change() {
        let monitor = NetworkMonitor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = monitor.on_status_change(move |c| sink.lock().push(c));

        monitor.set_connected(false);
        monitor.set_connected(true);
        assert_eq!(*seen.lock(), vec![false, true]);
    }

    #[test]
    fn dropped_subscription_stops_callbacks() {
        let monitor = NetworkMonitor::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sub = monitor.on_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(monitor.listener_count(), 1);

        sub.unsubscribe();
        assert_eq!(monitor.listener_count(), 0);
        monitor.set_connected(false);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_result_is_applied() {
        let monitor = NetworkMonitor::with_probe(Arc::new(FixedProbe(Ok(false))));
        assert!(!monitor.refresh().await);
        assert!(!monitor.is_connected());
    }

    #[tokio::test]
    async fn failing_probe_fails_open() {
        let monitor =
            NetworkMonitor::with_probe(Arc::new(FixedProbe(Err(ProbeError("no route".into())))));
        monitor.set_connected(false);
        assert!(monitor.refresh().await);
        assert!(monitor.is_connected());
    }
}
