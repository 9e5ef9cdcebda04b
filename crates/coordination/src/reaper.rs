//! Periodic cleanup of finished and expired coordination records

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::persistence::{CoordinationStore, ReapReport};

/// Sweeps the store on a fixed interval
///
/// Lazy expiry checks keep correctness without it; the reaper only deletes
/// rows to bound table growth. Deleting an expired holder bumps the queue
/// version, and waiters take its permits on their next poll.
pub struct Reaper {
    store: Arc<dyn CoordinationStore>,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn CoordinationStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One sweep at the current time
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<ReapReport> {
        let report = self.store.reap(Utc::now()).await?;
        if report.total() > 0 {
            info!(
                finished_instances = report.finished_instances,
                expired_instances = report.expired_instances,
                barriers = report.barriers,
                idempotent_locks = report.idempotent_locks,
                "Reaped coordination records"
            );
        }
        Ok(report)
    }

    /// Sweep until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Reaper sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Reaper: shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        debug!("Reaper loop exited");
    }
}
