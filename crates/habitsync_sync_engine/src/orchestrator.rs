//! Sync orchestrator: drives import, push, pull and queue-drain passes.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::remote::{RemoteResult, RemoteService};
use chrono::{DateTime, Days, NaiveDate, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use habitsync_store::{meta, LocalStore};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether a pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No pass in flight.
    Idle,
    /// A pass is in flight.
    Syncing,
}

/// A stage of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Pre-flight connectivity check.
    Connectivity,
    /// First-run import of the remote snapshot.
    Import,
    /// Upload of pending rows.
    Push,
    /// Download and merge of remote state.
    Pull,
    /// Replay of the sync queue.
    Drain,
    /// Final bookkeeping.
    Finish,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connectivity => "connectivity",
            Self::Import => "import",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Drain => "drain",
            Self::Finish => "finish",
        };
        f.write_str(name)
    }
}

/// A phase that stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    /// The phase.
    pub phase: SyncPhase,
    /// What went wrong.
    pub message: String,
    /// Whether the remote was unreachable.
    pub connectivity: bool,
}

/// Per-category outcome counts of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCounts {
    /// Rows inserted by the first-run import.
    pub imported: usize,
    /// Rows the remote confirmed during push.
    pub pushed: usize,
    /// Rows the remote rejected during push.
    pub push_failed: usize,
    /// Completions held back because their habit is not on the remote yet.
    pub deferred: usize,
    /// Rows written by pull.
    pub pulled: usize,
    /// Rows removed by pull because the remote no longer has them.
    pub removed: usize,
    /// Queue items replayed successfully.
    pub queue_replayed: usize,
    /// Queue items acknowledged without a call because push already landed them.
    pub queue_superseded: usize,
    /// Queue items that failed and were rescheduled.
    pub queue_failed: usize,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// True if every phase completed and no item failed.
    pub success: bool,
    /// Outcome counts.
    pub counts: SyncCounts,
    /// Phases that stopped early.
    pub failures: Vec<PhaseFailure>,
    /// Pass start.
    pub started_at: DateTime<Utc>,
    /// Pass end.
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn offline(at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            counts: SyncCounts::default(),
            failures: vec![PhaseFailure {
                phase: SyncPhase::Connectivity,
                message: SyncError::NotConnected.to_string(),
                connectivity: true,
            }],
            started_at: at,
            finished_at: at,
        }
    }

    fn aborted(at: DateTime<Utc>, message: String) -> Self {
        Self {
            success: false,
            counts: SyncCounts::default(),
            failures: vec![PhaseFailure {
                phase: SyncPhase::Finish,
                message,
                connectivity: false,
            }],
            started_at: at,
            finished_at: at,
        }
    }

    /// Returns true if the pass was skipped or cut short by connectivity.
    pub fn is_offline(&self) -> bool {
        self.failures.iter().any(|f| f.connectivity)
    }
}

type PassFuture = Shared<BoxFuture<'static, SyncReport>>;

pub(crate) struct Engine {
    pub(crate) store: Arc<LocalStore>,
    pub(crate) remote: Arc<dyn RemoteService>,
    pub(crate) network: NetworkMonitor,
    pub(crate) config: SyncConfig,
    in_flight: Mutex<Option<PassFuture>>,
    last_report: Mutex<Option<SyncReport>>,
}

/// Coordinates sync passes between the local store and the remote.
///
/// At most one pass runs at a time: calling [`SyncOrchestrator::sync`]
/// while a pass is in flight joins it and returns its report. Clones share
/// the same engine.
#[derive(Clone)]
pub struct SyncOrchestrator {
    engine: Arc<Engine>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteService>,
        network: NetworkMonitor,
        config: SyncConfig,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                store,
                remote,
                network,
                config,
                in_flight: Mutex::new(None),
                last_report: Mutex::new(None),
            }),
        }
    }

    /// Runs a sync pass, or joins the one in flight.
    ///
    /// The pass runs on a spawned task, so this must be called from within a
    /// tokio runtime. Dropping the returned future does not cancel the pass.
    pub async fn sync(&self) -> SyncReport {
        let pass = {
            let mut slot = self.engine.in_flight.lock();
            match slot.as_ref() {
                Some(pass) => {
                    debug!("joining in-flight sync pass");
                    pass.clone()
                }
                None => {
                    // The pass owns a task so it finishes even if every caller
                    // stops polling.
                    let engine = Arc::clone(&self.engine);
                    let task = tokio::spawn(async move {
                        let report = engine.run_pass().await;
                        *engine.last_report.lock() = Some(report.clone());
                        *engine.in_flight.lock() = None;
                        report
                    });
                    let engine = Arc::clone(&self.engine);
                    let pass = async move {
                        match task.await {
                            Ok(report) => report,
                            Err(e) => {
                                warn!(error = %e, "sync pass task ended abnormally");
                                let report = SyncReport::aborted(Utc::now(), e.to_string());
                                *engine.last_report.lock() = Some(report.clone());
                                *engine.in_flight.lock() = None;
                                report
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pass.clone());
                    pass
                }
            }
        };
        pass.await
    }

    /// Returns whether a pass is in flight.
    pub fn state(&self) -> SyncState {
        if self.engine.in_flight.lock().is_some() {
            SyncState::Syncing
        } else {
            SyncState::Idle
        }
    }

    /// Report of the last finished pass.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.engine.last_report.lock().clone()
    }

    /// The local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.engine.store
    }

    /// The network monitor.
    pub fn network(&self) -> &NetworkMonitor {
        &self.engine.network
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.engine.config
    }
}

impl Engine {
    async fn run_pass(&self) -> SyncReport {
        let started_at = Utc::now();
        if !self.network.is_connected() {
            info!("offline, sync pass skipped");
            return SyncReport::offline(started_at);
        }

        info!(user = %self.config.user_id, "sync pass started");
        let mut counts = SyncCounts::default();
        let mut failures = Vec::new();

        for phase in [SyncPhase::Import, SyncPhase::Push, SyncPhase::Pull, SyncPhase::Drain] {
            let result = match phase {
                SyncPhase::Import => self.import(&mut counts).await,
                SyncPhase::Push => self.push(&mut counts).await,
                SyncPhase::Pull => self.pull(&mut counts).await,
                SyncPhase::Drain => self.drain(&mut counts).await,
                SyncPhase::Connectivity | SyncPhase::Finish => Ok(()),
            };
            if let Err(e) = result {
                let connectivity = e.is_offline();
                warn!(%phase, error = %e, connectivity, "sync phase failed");
                failures.push(PhaseFailure {
                    phase,
                    message: e.to_string(),
                    connectivity,
                });
                if connectivity {
                    break;
                }
            }
        }

        let mut success = failures.is_empty() && counts.push_failed == 0 && counts.queue_failed == 0;
        let finished_at = Utc::now();
        if success {
            if let Err(e) = self.store.set_meta(meta::LAST_SYNC_AT, finished_at.to_rfc3339()) {
                warn!(error = %e, "failed to record sync time");
                failures.push(PhaseFailure {
                    phase: SyncPhase::Finish,
                    message: e.to_string(),
                    connectivity: false,
                });
                success = false;
            }
        }

        info!(
            success,
            imported = counts.imported,
            pushed = counts.pushed,
            push_failed = counts.push_failed,
            deferred = counts.deferred,
            pulled = counts.pulled,
            removed = counts.removed,
            replayed = counts.queue_replayed,
            superseded = counts.queue_superseded,
            queue_failed = counts.queue_failed,
            "sync pass finished"
        );

        SyncReport {
            success,
            counts,
            failures,
            started_at,
            finished_at,
        }
    }

    /// Awaits a remote call under the request timeout.
    pub(crate) async fn call<T, F>(&self, call: F) -> SyncResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// First and last day of the pull window, inclusive.
    pub(crate) fn window(&self) -> (NaiveDate, NaiveDate) {
        let today = Utc::now().date_naive();
        let back = Days::new(u64::from(self.config.step_window_days.saturating_sub(1)));
        (today.checked_sub_days(back).unwrap_or(NaiveDate::MIN), today)
    }
}
