//! Registry of published backends and the operations that change it.
//!
//! All operations acquire the same lock for their full duration, including
//! the load balancer and runtime calls they make, so publish, drain,
//! unpublish, stop and the drain sweep never interleave.
//!
//! A record exists only while the load balancer has acknowledged it with a
//! non-negative weight, or while its removal is still pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::balancer::{Backend, BalancerChannel, BalancerError, ControlEndpoint, Weight};
use crate::config::Defaults;
use crate::container::ContainerDescriptor;
use crate::network::{NetworkError, SelfNetworks};
use crate::resolver::{resolve, ResolveError};
use crate::runtime::{ContainerRuntime, RuntimeError, StopOutcome};

/// Errors from registry operations. None of them leave the registry out of
/// step with the last acknowledged load balancer update.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Balancer(#[from] BalancerError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Where a published backend is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    /// Weight 1.
    InService,
    /// Weight 0, waiting for connections to finish.
    Draining,
    /// Drained; a stop was issued and the exit event is pending.
    Stopping,
    /// The container is gone but the removal was not acknowledged yet.
    Retiring,
}

/// A published backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    pub container_id: String,
    pub glbctl: ControlEndpoint,
    pub app_id: String,
    pub backend: Backend,
    pub deploy_tag: String,
    pub phase: BackendPhase,
}

/// Outcome of a successful publish.
#[derive(Debug, Clone)]
pub struct Published {
    pub record: BackendRecord,
    /// Containers of the same app on another deploy that were sent to drain.
    pub replaced: Vec<String>,
}

/// Outcome of one drain sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Containers a stop was issued for.
    pub stopped: Vec<String>,
    /// Records whose pending removal was completed.
    pub removed: Vec<String>,
    /// Load balancers whose table could not be read.
    pub failed_queries: usize,
}

type Records = HashMap<String, BackendRecord>;

/// Published backends plus the collaborators needed to change them.
pub struct Registry {
    records: Mutex<Records>,
    defaults: Defaults,
    self_networks: SelfNetworks,
    balancer: Arc<dyn BalancerChannel>,
    runtime: Arc<dyn ContainerRuntime>,
    stop_grace: Duration,
}

impl Registry {
    pub fn new(
        defaults: Defaults,
        self_networks: SelfNetworks,
        balancer: Arc<dyn BalancerChannel>,
        runtime: Arc<dyn ContainerRuntime>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            defaults,
            self_networks,
            balancer,
            runtime,
            stop_grace,
        }
    }

    /// Copy of a single record.
    pub async fn get(&self, container_id: &str) -> Option<BackendRecord> {
        self.records.lock().await.get(container_id).cloned()
    }

    /// All records, ordered by container id.
    pub async fn snapshot(&self) -> Vec<BackendRecord> {
        let mut records: Vec<BackendRecord> =
            self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        records
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Register a container as an in-service backend and drain any tracked
    /// instance of the same app running another deploy.
    pub async fn publish(&self, container: &ContainerDescriptor) -> Result<Published, RegistryError> {
        let mut records = self.records.lock().await;

        let registration = resolve(container, &self.defaults)?;
        let host = self
            .self_networks
            .reachable_address(&container.id, &container.networks)?;
        let backend = Backend::new(host, registration.app_port);

        self.balancer
            .set_weight(&registration.glbctl, &backend, Weight::InService)
            .await?;

        let record = BackendRecord {
            container_id: container.id.clone(),
            glbctl: registration.glbctl,
            app_id: registration.app_id,
            backend,
            deploy_tag: registration.deploy_tag,
            phase: BackendPhase::InService,
        };

        if let Some(previous) = records.insert(record.container_id.clone(), record.clone()) {
            if previous.backend != record.backend || previous.glbctl != record.glbctl {
                self.forget_moved_backend(&previous).await;
            }
        }

        info!(
            container_id = %record.container_id,
            backend = %record.backend,
            app_id = %record.app_id,
            deploy_tag = %record.deploy_tag,
            lb = %record.glbctl,
            "Backend published"
        );

        let mut replaced: Vec<String> = records
            .values()
            .filter(|r| {
                r.container_id != record.container_id
                    && r.app_id == record.app_id
                    && r.deploy_tag != record.deploy_tag
                    && r.phase == BackendPhase::InService
            })
            .map(|r| r.container_id.clone())
            .collect();
        replaced.sort();

        for stale_id in &replaced {
            info!(
                container_id = %stale_id,
                replaced_by = %record.container_id,
                deploy_tag = %record.deploy_tag,
                "Draining replaced backend"
            );
            if let Err(e) = self.drain_locked(&mut records, stale_id).await {
                error!(container_id = %stale_id, error = %e, "Failed to drain replaced backend");
            }
        }

        Ok(Published { record, replaced })
    }

    /// Stop routing new traffic to a backend. Returns `false` when the
    /// container is not tracked.
    pub async fn drain(&self, container_id: &str) -> Result<bool, RegistryError> {
        let mut records = self.records.lock().await;
        self.drain_locked(&mut records, container_id).await
    }

    /// Remove a backend from the load balancer and the registry.
    ///
    /// Returns the removed record, or `None` when the container is not
    /// tracked. When the load balancer cannot be reached or refuses the
    /// removal the record is kept as [`BackendPhase::Retiring`] and the
    /// drain sweep retries it. A balancer that does not know the backend
    /// counts as removed.
    pub async fn unpublish(
        &self,
        container_id: &str,
    ) -> Result<Option<BackendRecord>, RegistryError> {
        let mut records = self.records.lock().await;
        self.unpublish_locked(&mut records, container_id).await
    }

    /// Ask the runtime to stop a container. The registry is not changed; the
    /// resulting exit event unpublishes the backend.
    pub async fn stop_container(&self, container_id: &str) -> Result<StopOutcome, RegistryError> {
        let _records = self.records.lock().await;
        self.stop_unlocked(container_id).await
    }

    /// Stop every container whose backend is fully drained and idle, and
    /// retry pending removals.
    pub async fn sweep_drained(&self) -> SweepReport {
        let mut records = self.records.lock().await;
        let mut report = SweepReport::default();

        let mut retiring: Vec<String> = records
            .values()
            .filter(|r| r.phase == BackendPhase::Retiring)
            .map(|r| r.container_id.clone())
            .collect();
        retiring.sort();
        for id in retiring {
            match self.unpublish_locked(&mut records, &id).await {
                Ok(Some(_)) => report.removed.push(id),
                Ok(None) => {}
                Err(e) => warn!(container_id = %id, error = %e, "Pending removal still failing"),
            }
        }

        let mut by_endpoint: HashMap<ControlEndpoint, Vec<(String, Backend)>> = HashMap::new();
        for record in records.values() {
            if record.phase == BackendPhase::Stopping || record.phase == BackendPhase::Retiring {
                continue;
            }
            by_endpoint
                .entry(record.glbctl.clone())
                .or_default()
                .push((record.container_id.clone(), record.backend.clone()));
        }

        let mut drained = Vec::new();
        for (endpoint, members) in by_endpoint {
            let table = match self.balancer.table(&endpoint).await {
                Ok(table) => table,
                Err(e) => {
                    error!(lb = %endpoint, error = %e, "Cannot read load balancer table");
                    report.failed_queries += 1;
                    continue;
                }
            };

            for (container_id, backend) in members {
                let Some(entry) = table.get(&backend) else {
                    continue;
                };
                if entry.is_drained() {
                    info!(
                        container_id = %container_id,
                        backend = %backend,
                        connections = entry.connections,
                        "Backend drained"
                    );
                    drained.push(container_id);
                }
            }
        }

        drained.sort();
        for container_id in drained {
            if self.stop_drained_locked(&mut records, &container_id).await {
                report.stopped.push(container_id);
            }
        }

        report
    }

    async fn drain_locked(
        &self,
        records: &mut Records,
        container_id: &str,
    ) -> Result<bool, RegistryError> {
        let Some(record) = records.get(container_id) else {
            warn!(container_id = %container_id, "Cannot drain, backend not published");
            return Ok(false);
        };
        let (glbctl, backend) = (record.glbctl.clone(), record.backend.clone());

        self.balancer
            .set_weight(&glbctl, &backend, Weight::Draining)
            .await?;

        if let Some(record) = records.get_mut(container_id) {
            if record.phase == BackendPhase::InService {
                record.phase = BackendPhase::Draining;
            }
        }

        info!(
            container_id = %container_id,
            backend = %backend,
            lb = %glbctl,
            "Backend draining"
        );
        Ok(true)
    }

    async fn unpublish_locked(
        &self,
        records: &mut Records,
        container_id: &str,
    ) -> Result<Option<BackendRecord>, RegistryError> {
        let Some(record) = records.get(container_id) else {
            debug!(container_id = %container_id, "Cannot unpublish, backend not published");
            return Ok(None);
        };
        let (glbctl, backend) = (record.glbctl.clone(), record.backend.clone());

        match self
            .balancer
            .set_weight(&glbctl, &backend, Weight::Removed)
            .await
        {
            Ok(()) => {}
            // Nothing routes to this backend any more.
            Err(BalancerError::UnknownBackend { message, .. }) => {
                warn!(
                    container_id = %container_id,
                    backend = %backend,
                    lb = %glbctl,
                    reply = %message,
                    "Load balancer does not know backend, treating it as removed"
                );
            }
            Err(e) => {
                if let Some(record) = records.get_mut(container_id) {
                    record.phase = BackendPhase::Retiring;
                }
                return Err(e.into());
            }
        }

        let removed = records.remove(container_id);
        info!(
            container_id = %container_id,
            backend = %backend,
            lb = %glbctl,
            "Backend unpublished"
        );
        Ok(removed)
    }

    async fn stop_unlocked(&self, container_id: &str) -> Result<StopOutcome, RegistryError> {
        let outcome = self.runtime.stop(container_id, self.stop_grace).await?;
        match outcome {
            StopOutcome::Stopped => info!(container_id = %container_id, "Stop requested"),
            StopOutcome::NotFound => {
                warn!(container_id = %container_id, "Cannot stop, container not found")
            }
        }
        Ok(outcome)
    }

    /// Returns `true` when a stop was issued.
    async fn stop_drained_locked(&self, records: &mut Records, container_id: &str) -> bool {
        let Some(previous) = records.get_mut(container_id).map(|r| {
            let previous = r.phase;
            r.phase = BackendPhase::Stopping;
            previous
        }) else {
            return false;
        };

        match self.stop_unlocked(container_id).await {
            Ok(StopOutcome::Stopped) => true,
            Ok(StopOutcome::NotFound) => {
                // No exit event will follow for a container that is gone.
                if let Err(e) = self.unpublish_locked(records, container_id).await {
                    error!(container_id = %container_id, error = %e, "Failed to unpublish vanished container");
                }
                false
            }
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Failed to stop drained container");
                if let Some(record) = records.get_mut(container_id) {
                    record.phase = previous;
                }
                false
            }
        }
    }

    /// Best-effort removal of the entry a republished container used before
    /// its address changed.
    async fn forget_moved_backend(&self, previous: &BackendRecord) {
        match self
            .balancer
            .set_weight(&previous.glbctl, &previous.backend, Weight::Removed)
            .await
        {
            Ok(()) => info!(
                container_id = %previous.container_id,
                backend = %previous.backend,
                lb = %previous.glbctl,
                "Removed previous backend address"
            ),
            Err(e) => warn!(
                container_id = %previous.container_id,
                backend = %previous.backend,
                error = %e,
                "Failed to remove previous backend address"
            ),
        }
    }
}
