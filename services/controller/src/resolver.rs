//! Per-container registration parameters.
//!
//! Every parameter is resolved independently: a label override when present
//! and valid, otherwise a value computed from the container or the
//! configured defaults. A malformed label falls back instead of failing.
//! Only the backend port can end up unresolved.

use thiserror::Error;
use tracing::warn;

use crate::balancer::ControlEndpoint;
use crate::config::{labels, Defaults};
use crate::container::{ContainerDescriptor, PortProtocol};

/// Resolution failures. Terminal for the publish attempt; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("container {container_id} has no app port label, no exposed TCP port and no default app port")]
    NoAppPort { container_id: String },
}

/// Registration parameters for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Control channel of the load balancer to register with.
    pub glbctl: ControlEndpoint,
    pub app_id: String,
    pub app_port: u16,
    pub deploy_tag: String,
}

fn string_label(container: &ContainerDescriptor, key: &str) -> Option<String> {
    container
        .label(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn port_label(container: &ContainerDescriptor, key: &str) -> Option<u16> {
    let raw = container.label(key)?;
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        _ => {
            warn!(
                container_id = %container.id,
                label = key,
                value = raw,
                "Ignoring invalid port label"
            );
            None
        }
    }
}

/// Image reference without its tag or digest.
///
/// A registry port (`registry:5000/app`) is not mistaken for a tag.
pub fn image_name(image: &str) -> &str {
    let image = image.split_once('@').map_or(image, |(name, _)| name);
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => name,
        _ => image,
    }
}

/// First TCP port the container exposes.
pub fn first_tcp_port(container: &ContainerDescriptor) -> Option<u16> {
    container
        .exposed_ports
        .iter()
        .filter(|p| p.protocol == PortProtocol::Tcp && p.port > 0)
        .map(|p| p.port)
        .min()
}

/// Resolve the registration parameters of `container`.
pub fn resolve(
    container: &ContainerDescriptor,
    defaults: &Defaults,
) -> Result<Registration, ResolveError> {
    let glbctl_host = string_label(container, labels::GLBCTL_HOST)
        .unwrap_or_else(|| defaults.glbctl_host.clone());

    let glbctl_port = port_label(container, labels::GLBCTL_PORT).unwrap_or(defaults.glbctl_port);

    let app_id = string_label(container, labels::APP_ID)
        .unwrap_or_else(|| image_name(&container.image).to_string());

    let app_port = port_label(container, labels::APP_PORT)
        .or_else(|| first_tcp_port(container))
        .or(defaults.app_port)
        .ok_or_else(|| ResolveError::NoAppPort {
            container_id: container.id.clone(),
        })?;

    let deploy_tag = string_label(container, labels::APP_DEPLOY).unwrap_or_else(|| {
        container
            .image_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| container.image.clone())
    });

    Ok(Registration {
        glbctl: ControlEndpoint::new(glbctl_host, glbctl_port),
        app_id,
        app_port,
        deploy_tag,
    })
}
