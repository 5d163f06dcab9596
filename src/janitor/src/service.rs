//! Periodic scheduling of cleanup passes.

use crate::engine::ReconciliationEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

/// Runs the stale-build recovery once, then a cleanup pass on every tick
/// until shutdown is signalled.
pub struct JanitorService {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
    staleness_window: Duration,
}

impl JanitorService {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        interval: Duration,
        staleness_window: Duration,
    ) -> Self {
        Self {
            engine,
            interval,
            staleness_window,
        }
    }

    /// Returns once `shutdown` turns `true` or its sender is dropped.
    /// A failed pass is logged and retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.engine.force_stale_to_done(self.staleness_window).await {
            Ok(0) => tracing::debug!("No stale builds to recover"),
            Ok(count) => tracing::info!(count, "Recovered stale builds"),
            Err(e) => tracing::error!(error = %e, "Stale build recovery failed"),
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.interval, "Janitor service running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!("Running cleanup pass");
                    if let Err(e) = self.engine.run_cleanup_pass().await {
                        tracing::error!(error = %e, "Cleanup pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Janitor service stopped");
    }
}
