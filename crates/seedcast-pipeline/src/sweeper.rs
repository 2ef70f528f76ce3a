//! Periodic orphan sweep of the temp directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::store::TempFileStore;

/// Shortest interval accepted; guards `tokio::time::interval` against zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Deletes stale temp files on a timer, independent of session bookkeeping.
#[derive(Debug, Clone)]
pub struct CleanupSweeper {
    store: Arc<TempFileStore>,
    interval: Duration,
    retention: Duration,
}

impl CleanupSweeper {
    pub fn new(store: Arc<TempFileStore>, interval: Duration, retention: Duration) -> Self {
        Self {
            store,
            interval: interval.max(MIN_INTERVAL),
            retention,
        }
    }

    /// Start the background loop on `tracker`.
    ///
    /// The first pass runs immediately. The loop exits when `cancel` fires;
    /// an idle timer never keeps the runtime from shutting down.
    pub fn start(self, tracker: &TaskTracker, cancel: CancellationToken) {
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }
            tracing::debug!("Cleanup sweeper stopped");
        });
    }

    /// One sweep pass.
    pub async fn run_once(&self) -> crate::store::SweepReport {
        let report = self.store.sweep(self.retention).await;
        if report.removed > 0 || report.failed > 0 {
            tracing::info!(
                removed = report.removed,
                failed = report.failed,
                scanned = report.scanned,
                "Temp directory sweep finished"
            );
        } else {
            tracing::debug!(scanned = report.scanned, "Temp directory sweep found nothing stale");
        }
        report
    }
}
