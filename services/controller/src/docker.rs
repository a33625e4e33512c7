//! Docker Engine implementation of [`ContainerRuntime`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, StopContainerOptions};
use bollard::models::{ContainerInspectResponse, EventMessage, HealthStatusEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::container::{ContainerDescriptor, ExposedPort, HealthState, RuntimeEvent};
use crate::runtime::{ContainerRuntime, EventStream, RuntimeError, StopOutcome};

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(Self { docker })
    }
}

fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![label.to_string()])])
}

fn map_error(err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api(other.to_string()),
    }
}

/// Keep only container events that name an actor and an action.
fn to_runtime_event(message: EventMessage) -> Option<RuntimeEvent> {
    let action = message.action?;
    let container_id = message.actor?.id?;
    Some(RuntimeEvent {
        container_id,
        action,
    })
}

/// Convert an inspect response into the controller's container view.
pub fn to_descriptor(info: ContainerInspectResponse) -> ContainerDescriptor {
    let config = info.config.unwrap_or_default();
    let settings = info.network_settings.unwrap_or_default();

    // Published/declared ports from the live port map first, image config second.
    let mut port_keys: Vec<String> = settings
        .ports
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    if port_keys.is_empty() {
        port_keys = config
            .exposed_ports
            .map(|ports| ports.into_keys().collect())
            .unwrap_or_default();
    }
    let mut exposed_ports: Vec<ExposedPort> =
        port_keys.iter().filter_map(|k| ExposedPort::parse(k)).collect();
    exposed_ports.sort();

    let networks: BTreeMap<String, String> = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
        .collect();

    let health = info
        .state
        .and_then(|state| state.health)
        .and_then(|health| health.status)
        .and_then(|status| match status {
            HealthStatusEnum::HEALTHY => Some(HealthState::Healthy),
            HealthStatusEnum::UNHEALTHY => Some(HealthState::Unhealthy),
            HealthStatusEnum::STARTING => Some(HealthState::Starting),
            _ => None,
        });

    ContainerDescriptor {
        id: info.id.unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        image_id: info.image,
        labels: config.labels.unwrap_or_default(),
        exposed_ports,
        networks,
        health,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn subscribe(&self, label: &str) -> Result<EventStream, RuntimeError> {
        let mut filters = label_filter(label);
        filters.insert("type".to_string(), vec!["container".to_string()]);

        debug!(label, "Subscribing to docker events");

        let stream = self
            .docker
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|item| async move {
                match item {
                    Ok(message) => to_runtime_event(message).map(Ok),
                    Err(e) => Some(Err(RuntimeError::Stream(e.to_string()))),
                }
            });

        Ok(Box::pin(stream))
    }

    async fn list_running(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                filters: label_filter(label),
                ..Default::default()
            }))
            .await
            .map_err(map_error)?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;
        Ok(to_descriptor(info))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<StopOutcome, RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => {
                info!(container_id = %id, "Container stopped");
                Ok(StopOutcome::Stopped)
            }
            Err(e) => match map_error(e) {
                RuntimeError::NotFound(_) => Ok(StopOutcome::NotFound),
                other => Err(other),
            },
        }
    }
}
