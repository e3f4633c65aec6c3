//! Periodic physical cleanup of expired and evicted entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::traits::ContentCache;

/// Default sweep period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

pub struct Janitor;

impl Janitor {
    /// Start sweeping `cache` every `period` on the current tokio runtime.
    ///
    /// Sweeps run on the blocking pool so filesystem work never stalls the
    /// runtime or callers of the cache.
    pub fn spawn(cache: Arc<dyn ContentCache>, period: Duration) -> JanitorHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "cache janitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cache = Arc::clone(&cache);
                        match tokio::task::spawn_blocking(move || cache.sweep()).await {
                            Ok(report) if report.failed > 0 => warn!(
                                scanned = report.scanned,
                                deleted = report.deleted,
                                failed = report.failed,
                                "cache sweep finished with failures"
                            ),
                            Ok(report) => debug!(
                                scanned = report.scanned,
                                deleted = report.deleted,
                                "cache sweep finished"
                            ),
                            Err(e) => warn!(error = %e, "cache sweep panicked"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("cache janitor stopped");
        });
        JanitorHandle { shutdown, task }
    }
}

/// Owner handle for a running janitor.
pub struct JanitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stop the janitor and wait for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "cache janitor task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
