//! Background sync: periodic passes plus passes on reconnection.

use crate::network::Subscription;
use crate::orchestrator::SyncOrchestrator;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runs sync passes on a tokio task.
///
/// A pass starts when the interval elapses, when the network monitor reports
/// a reconnection, or when [`BackgroundSync::trigger`] is called. Triggers
/// that arrive while a pass is queued are coalesced into it.
pub struct BackgroundSync {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    _reconnection: Subscription,
}

impl BackgroundSync {
    /// Starts the background task. `None` disables the timer; reconnection
    /// and manual triggers still run passes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(orchestrator: SyncOrchestrator, interval: Option<Duration>) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let on_reconnect = trigger_tx.clone();
        let reconnection = orchestrator.network().on_reconnection(move || {
            debug!("reconnected, scheduling sync");
            let _ = on_reconnect.try_send(());
        });

        let handle = tokio::spawn(run(orchestrator, interval, trigger_rx, shutdown_rx));
        info!(?interval, "background sync started");

        Self {
            trigger_tx,
            shutdown_tx,
            handle,
            _reconnection: reconnection,
        }
    }

    /// Requests a pass. Returns false if one is already queued.
    pub fn trigger(&self) -> bool {
        self.trigger_tx.try_send(()).is_ok()
    }

    /// Stops the task after the pass in flight, if any, completes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "background sync task ended abnormally");
        }
        info!("background sync stopped");
    }
}

async fn run(
    orchestrator: SyncOrchestrator,
    interval: Option<Duration>,
    mut trigger_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval.filter(|period| !period.is_zero()).map(|period| {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,
            Some(()) = trigger_rx.recv() => {
                debug!("sync triggered");
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                debug!("sync interval elapsed");
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        let report = orchestrator.sync().await;
        if !report.success {
            debug!(offline = report.is_offline(), "background sync pass incomplete");
        }
    }
}
