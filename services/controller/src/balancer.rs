//! Load balancer control channel interface.
//!
//! Each call is a short-lived session: connect, operate, close. There is no
//! pooling and no application-level retry; a failed call only fails the
//! operation that issued it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use zdlb_glbctl::{GlbCtl, GlbCtlError, Node};

/// Ternary routing state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Weight {
    /// Route new traffic.
    InService,
    /// No new traffic; existing connections finish.
    Draining,
    /// Remove the backend entry entirely.
    Removed,
}

impl Weight {
    pub fn value(self) -> i32 {
        match self {
            Weight::InService => 1,
            Weight::Draining => 0,
            Weight::Removed => -1,
        }
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Address of a load balancer control channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlEndpoint {
    pub host: String,
    pub port: u16,
}

impl ControlEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A traffic target registered with the load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// State of one backend as reported by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableEntry {
    pub weight: f64,
    pub connections: u64,
}

impl TableEntry {
    /// No new traffic routed and no connection left open.
    pub fn is_drained(&self) -> bool {
        self.weight <= 0.0 && self.connections == 0
    }
}

/// Errors from the load balancer control channel.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("load balancer at {endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("load balancer at {endpoint} rejected request: {message}")]
    Rejected { endpoint: String, message: String },

    #[error("load balancer at {endpoint} does not route to the backend: {message}")]
    UnknownBackend { endpoint: String, message: String },
}

/// Load balancer control channel.
#[async_trait]
pub trait BalancerChannel: Send + Sync {
    /// Set the weight of `backend` on the balancer at `endpoint`.
    async fn set_weight(
        &self,
        endpoint: &ControlEndpoint,
        backend: &Backend,
        weight: Weight,
    ) -> Result<(), BalancerError>;

    /// Read the balancer's backend table.
    async fn table(
        &self,
        endpoint: &ControlEndpoint,
    ) -> Result<HashMap<Backend, TableEntry>, BalancerError>;
}

/// glbd control socket implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlbBalancer;

impl GlbBalancer {
    pub fn new() -> Self {
        Self
    }
}

fn map_glb_error(endpoint: &ControlEndpoint, err: GlbCtlError) -> BalancerError {
    match err {
        GlbCtlError::Rejected(message) => BalancerError::Rejected {
            endpoint: endpoint.to_string(),
            message,
        },
        GlbCtlError::UnknownDestination(message) => BalancerError::UnknownBackend {
            endpoint: endpoint.to_string(),
            message,
        },
        other => BalancerError::Unreachable {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl BalancerChannel for GlbBalancer {
    async fn set_weight(
        &self,
        endpoint: &ControlEndpoint,
        backend: &Backend,
        weight: Weight,
    ) -> Result<(), BalancerError> {
        let mut ctl = GlbCtl::connect(&endpoint.host, endpoint.port)
            .await
            .map_err(|e| map_glb_error(endpoint, e))?;

        let node = Node::new(backend.host.clone(), backend.port);
        ctl.update(&node, weight.value())
            .await
            .map_err(|e| map_glb_error(endpoint, e))
    }

    async fn table(
        &self,
        endpoint: &ControlEndpoint,
    ) -> Result<HashMap<Backend, TableEntry>, BalancerError> {
        let mut ctl = GlbCtl::connect(&endpoint.host, endpoint.port)
            .await
            .map_err(|e| map_glb_error(endpoint, e))?;

        let info = ctl
            .get_info()
            .await
            .map_err(|e| map_glb_error(endpoint, e))?;

        debug!(lb = %endpoint, destinations = info.router().len(), "Fetched router table");

        Ok(info
            .into_router()
            .into_iter()
            .map(|(node, entry)| {
                (
                    Backend::new(node.host, node.port),
                    TableEntry {
                        weight: entry.weight,
                        connections: entry.connections,
                    },
                )
            })
            .collect())
    }
}

/// A recorded `set_weight` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightCall {
    pub endpoint: ControlEndpoint,
    pub backend: Backend,
    pub weight: Weight,
}

#[derive(Default)]
struct MockBalancerState {
    calls: Vec<WeightCall>,
    table_queries: usize,
    tables: HashMap<ControlEndpoint, HashMap<Backend, TableEntry>>,
    unreachable: bool,
    rejection: Option<String>,
}

/// In-memory balancer for tests and development.
///
/// Applies weight updates to its own table (a draining backend keeps its
/// connection count, a removed one disappears), so sweeps observe the
/// effect of earlier calls. Removing a backend missing from the table
/// fails with [`BalancerError::UnknownBackend`], as glbd does.
#[derive(Default)]
pub struct MockBalancer {
    state: Mutex<MockBalancerState>,
}

impl MockBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockBalancerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call fail as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Answer every `set_weight` call with this rejection; `None` clears it.
    pub fn reject_with(&self, reply: Option<&str>) {
        self.state().rejection = reply.map(str::to_string);
    }

    /// Drop a table entry behind the registry's back.
    pub fn forget_entry(&self, endpoint: &ControlEndpoint, backend: &Backend) {
        if let Some(table) = self.state().tables.get_mut(endpoint) {
            table.remove(backend);
        }
    }

    /// Overwrite a table entry.
    pub fn set_entry(&self, endpoint: &ControlEndpoint, backend: Backend, entry: TableEntry) {
        self.state()
            .tables
            .entry(endpoint.clone())
            .or_default()
            .insert(backend, entry);
    }

    /// Set the open connection count of an existing entry.
    pub fn set_connections(&self, endpoint: &ControlEndpoint, backend: &Backend, connections: u64) {
        if let Some(entry) = self
            .state()
            .tables
            .get_mut(endpoint)
            .and_then(|t| t.get_mut(backend))
        {
            entry.connections = connections;
        }
    }

    pub fn entry(&self, endpoint: &ControlEndpoint, backend: &Backend) -> Option<TableEntry> {
        self.state()
            .tables
            .get(endpoint)
            .and_then(|t| t.get(backend))
            .copied()
    }

    /// All `set_weight` calls, in order. Failed calls are included.
    pub fn calls(&self) -> Vec<WeightCall> {
        self.state().calls.clone()
    }

    /// Weights sent for one backend, in order.
    pub fn weights_for(&self, backend: &Backend) -> Vec<Weight> {
        self.state()
            .calls
            .iter()
            .filter(|c| &c.backend == backend)
            .map(|c| c.weight)
            .collect()
    }

    pub fn table_queries(&self) -> usize {
        self.state().table_queries
    }
}

#[async_trait]
impl BalancerChannel for MockBalancer {
    async fn set_weight(
        &self,
        endpoint: &ControlEndpoint,
        backend: &Backend,
        weight: Weight,
    ) -> Result<(), BalancerError> {
        let mut state = self.state();
        state.calls.push(WeightCall {
            endpoint: endpoint.clone(),
            backend: backend.clone(),
            weight,
        });

        if state.unreachable {
            return Err(BalancerError::Unreachable {
                endpoint: endpoint.to_string(),
                message: "[MOCK] connection refused".to_string(),
            });
        }
        if let Some(reply) = &state.rejection {
            return Err(BalancerError::Rejected {
                endpoint: endpoint.to_string(),
                message: reply.clone(),
            });
        }

        let table = state.tables.entry(endpoint.clone()).or_default();
        match weight {
            Weight::Removed => {
                if table.remove(backend).is_none() {
                    return Err(BalancerError::UnknownBackend {
                        endpoint: endpoint.to_string(),
                        message: "[MOCK] no such destination".to_string(),
                    });
                }
            }
            Weight::InService | Weight::Draining => {
                let entry = table.entry(backend.clone()).or_insert(TableEntry {
                    weight: 0.0,
                    connections: 0,
                });
                entry.weight = f64::from(weight.value());
            }
        }
        Ok(())
    }

    async fn table(
        &self,
        endpoint: &ControlEndpoint,
    ) -> Result<HashMap<Backend, TableEntry>, BalancerError> {
        let mut state = self.state();
        state.table_queries += 1;

        if state.unreachable {
            return Err(BalancerError::Unreachable {
                endpoint: endpoint.to_string(),
                message: "[MOCK] connection refused".to_string(),
            });
        }

        Ok(state.tables.get(endpoint).cloned().unwrap_or_default())
    }
}
