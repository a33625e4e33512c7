//! Runtime-neutral view of a container.
//!
//! The Docker adapter converts inspect responses into these types so the
//! resolver, network matcher and registry never see runtime API models.

use std::collections::{BTreeMap, HashMap};

/// Protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

impl PortProtocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "sctp" => Some(Self::Sctp),
            _ => None,
        }
    }
}

/// A port declared by the container (`8080/tcp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: PortProtocol,
}

impl ExposedPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: PortProtocol::Tcp,
        }
    }

    /// Parse the runtime's `<port>/<proto>` notation. A bare port is TCP.
    pub fn parse(raw: &str) -> Option<Self> {
        let (port, protocol) = match raw.split_once('/') {
            Some((port, proto)) => (port, PortProtocol::parse(proto)?),
            None => (raw, PortProtocol::Tcp),
        };
        Some(Self {
            port: port.trim().parse().ok()?,
            protocol,
        })
    }
}

/// Health check state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// Everything the controller needs to know about one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerDescriptor {
    /// Runtime container id.
    pub id: String,

    /// Image reference the container was created from (`registry/app:1.2`).
    pub image: String,

    /// Resolved image id/digest, when the runtime reports one.
    pub image_id: Option<String>,

    pub labels: HashMap<String, String>,

    pub exposed_ports: Vec<ExposedPort>,

    /// Attached networks, name to IP address.
    pub networks: BTreeMap<String, String>,

    /// `None` when the container has no health check.
    pub health: Option<HealthState>,
}

impl ContainerDescriptor {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn has_label(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }

    /// Healthy, or running without a health check.
    pub fn is_ready(&self) -> bool {
        matches!(self.health, None | Some(HealthState::Healthy))
    }
}

/// A container lifecycle event from the runtime's live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub container_id: String,
    pub action: String,
}

impl RuntimeEvent {
    pub fn new(container_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            action: action.into(),
        }
    }
}
