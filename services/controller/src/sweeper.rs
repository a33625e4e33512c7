//! Periodic drain sweep.
//!
//! Closes the replacement loop: once a draining backend has no connections
//! left, its container is stopped. The runtime's exit event then unpublishes
//! it through the event consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::registry::{Registry, SweepReport};

/// Drives [`Registry::sweep_drained`] on a fixed period.
pub struct DrainSweeper {
    registry: Arc<Registry>,
    interval: Duration,
}

impl DrainSweeper {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting drain sweeper"
        );

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Drain sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single sweep.
    pub async fn sweep_once(&self) -> SweepReport {
        let report = self.registry.sweep_drained().await;
        if report.stopped.is_empty() && report.removed.is_empty() && report.failed_queries == 0 {
            debug!("Drain sweep found nothing to do");
        } else {
            info!(
                stopped = ?report.stopped,
                removed = ?report.removed,
                failed_queries = report.failed_queries,
                "Drain sweep complete"
            );
        }
        report
    }
}
