//! Container event consumer.
//!
//! The consumer:
//! - Subscribes to lifecycle events of opted-in containers
//! - Publishes every running opted-in container once before consuming events
//! - Maps each event to a registry operation, one event at a time
//! - Re-subscribes and re-syncs when the event stream ends or fails

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::labels;
use crate::container::RuntimeEvent;
use crate::registry::{Registry, RegistryError};
use crate::runtime::{ContainerRuntime, EventStream, RuntimeError};

/// What a lifecycle action asks the registry to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Publish if the container is healthy or has no health check.
    Publish,
    Unpublish,
    Ignore,
}

/// Map a runtime action to an intent.
pub fn intent_for(action: &str) -> Intent {
    match action {
        "start" | "restart" | "unpause" | "health_status: healthy" => Intent::Publish,
        "die" | "oom" | "pause" | "health_status: unhealthy" => Intent::Unpublish,
        _ => Intent::Ignore,
    }
}

/// Outcome of a reconciliation sweep over running containers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub published: usize,
    /// Already tracked or not ready.
    pub skipped: usize,
    pub failed: usize,
    /// Tracked records whose container no longer runs.
    pub pruned: usize,
}

/// Why the consumer stopped reading a stream.
#[derive(Debug)]
pub enum StreamEnd {
    Shutdown,
    Closed,
    Failed(RuntimeError),
}

/// Consumer of the runtime's lifecycle event stream.
pub struct EventConsumer {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<Registry>,
    resubscribe_delay: Duration,
}

impl EventConsumer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<Registry>,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            resubscribe_delay,
        }
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(label = labels::ENABLED, "Starting event consumer");

        let mut resync = false;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = match self.runtime.subscribe(labels::ENABLED).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "Cannot subscribe to container events");
                    if self.wait_or_shutdown(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let report = self.reconcile_running(resync).await;
            info!(
                published = report.published,
                skipped = report.skipped,
                failed = report.failed,
                pruned = report.pruned,
                resync,
                "Running containers reconciled"
            );
            resync = true;

            match self.consume(stream, &mut shutdown).await {
                StreamEnd::Shutdown => break,
                StreamEnd::Closed => warn!("Container event stream closed, resubscribing"),
                StreamEnd::Failed(e) => {
                    error!(error = %e, "Container event stream failed, resubscribing")
                }
            }

            if self.wait_or_shutdown(&mut shutdown).await {
                break;
            }
        }

        info!("Event consumer shutting down");
    }

    /// Publish every running opted-in container that is ready and not tracked
    /// yet. Containers still starting or unhealthy wait for their health event.
    ///
    /// With `prune`, tracked records whose container is no longer running are
    /// unpublished first; events may have been missed while the stream was down.
    pub async fn reconcile_running(&self, prune: bool) -> SyncReport {
        let mut report = SyncReport::default();

        let ids = match self.runtime.list_running(labels::ENABLED).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Cannot list running containers");
                report.failed += 1;
                return report;
            }
        };
        let running: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let tracked = self.registry.snapshot().await;
        if prune {
            for record in &tracked {
                if running.contains(record.container_id.as_str()) {
                    continue;
                }
                info!(container_id = %record.container_id, "Tracked container no longer running");
                match self.registry.unpublish(&record.container_id).await {
                    Ok(_) => report.pruned += 1,
                    Err(e) => {
                        error!(container_id = %record.container_id, error = %e, "Failed to unpublish");
                        report.failed += 1;
                    }
                }
            }
        }
        let tracked: HashSet<String> = tracked.into_iter().map(|r| r.container_id).collect();

        for id in &ids {
            if tracked.contains(id) {
                report.skipped += 1;
                continue;
            }

            let container = match self.runtime.inspect(id).await {
                Ok(container) => container,
                Err(e) => {
                    error!(container_id = %id, error = %e, "Cannot inspect container");
                    report.failed += 1;
                    continue;
                }
            };

            if !container.is_ready() {
                debug!(container_id = %id, health = ?container.health, "Container not ready yet");
                report.skipped += 1;
                continue;
            }

            info!(container_id = %id, "Try to publish (already running)");
            match self.registry.publish(&container).await {
                Ok(_) => report.published += 1,
                Err(e) => {
                    error!(container_id = %id, error = %e, "Failed to publish");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Apply a single lifecycle event.
    pub async fn handle_event(&self, event: &RuntimeEvent) -> Result<(), RegistryError> {
        let id = event.container_id.as_str();

        match intent_for(&event.action) {
            Intent::Publish => {
                let container = self.runtime.inspect(id).await?;
                if !container.has_label(labels::ENABLED) {
                    debug!(container_id = %id, "Container not opted in");
                    return Ok(());
                }
                if !container.is_ready() {
                    debug!(
                        container_id = %id,
                        action = %event.action,
                        health = ?container.health,
                        "Container not healthy, not publishing"
                    );
                    return Ok(());
                }

                info!(container_id = %id, action = %event.action, "Try to publish");
                self.registry.publish(&container).await?;
            }
            Intent::Unpublish => {
                info!(container_id = %id, action = %event.action, "Try to unpublish");
                self.registry.unpublish(id).await?;
            }
            Intent::Ignore => {
                debug!(container_id = %id, action = %event.action, "Ignoring event");
            }
        }

        Ok(())
    }

    /// Read events until the stream ends or shutdown is signalled.
    pub async fn consume(
        &self,
        mut stream: EventStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle_event(&event).await {
                            error!(
                                container_id = %event.container_id,
                                action = %event.action,
                                error = %e,
                                "Failed to handle container event"
                            );
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    None => return StreamEnd::Closed,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return StreamEnd::Shutdown;
                    }
                }
            }
        }
    }

    /// Sleep for the resubscribe delay. Returns `true` on shutdown.
    async fn wait_or_shutdown(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.resubscribe_delay) => *shutdown.borrow(),
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}
