//! Shared-network address matching.
//!
//! The load balancer reaches a backend through a network it shares with the
//! controller. The first common network (by name) with an address wins.

use std::collections::BTreeMap;

use thiserror::Error;

/// No reachable address for a container.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("controller {controller_id} has no network")]
    ControllerDetached { controller_id: String },

    #[error("container {container_id} has no network")]
    ContainerDetached { container_id: String },

    #[error("container {container_id} has no network in common with controller {controller_id} ({container_networks:?} vs {controller_networks:?})")]
    NoCommonNetwork {
        container_id: String,
        controller_id: String,
        container_networks: Vec<String>,
        controller_networks: Vec<String>,
    },
}

/// Network attachments of the controller's own container.
#[derive(Debug, Clone, Default)]
pub struct SelfNetworks {
    pub controller_id: String,
    pub networks: BTreeMap<String, String>,
}

impl SelfNetworks {
    pub fn new(controller_id: impl Into<String>, networks: BTreeMap<String, String>) -> Self {
        Self {
            controller_id: controller_id.into(),
            networks,
        }
    }

    /// Address of `container_id` on a network shared with the controller.
    pub fn reachable_address(
        &self,
        container_id: &str,
        container_networks: &BTreeMap<String, String>,
    ) -> Result<String, NetworkError> {
        if self.networks.is_empty() {
            return Err(NetworkError::ControllerDetached {
                controller_id: self.controller_id.clone(),
            });
        }
        if container_networks.is_empty() {
            return Err(NetworkError::ContainerDetached {
                container_id: container_id.to_string(),
            });
        }

        container_networks
            .iter()
            .filter(|(name, _)| self.networks.contains_key(*name))
            .map(|(_, ip)| ip.trim())
            .find(|ip| !ip.is_empty())
            .map(str::to_string)
            .ok_or_else(|| NetworkError::NoCommonNetwork {
                container_id: container_id.to_string(),
                controller_id: self.controller_id.clone(),
                container_networks: container_networks.keys().cloned().collect(),
                controller_networks: self.networks.keys().cloned().collect(),
            })
    }
}
