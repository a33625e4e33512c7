//! zdlb controller library.
//!
//! The controller runs next to a glbd load balancer and keeps its backend
//! table in step with container lifecycle events: healthy opted-in
//! containers are published, stopped or unhealthy ones are removed, and a
//! new deploy of an app drains the old one until it can be stopped.
//!
//! ## Architecture
//!
//! ```text
//! EventConsumer ──intents──▶ Registry ──weights──▶ BalancerChannel (glbd)
//!                              ▲   │
//! DrainSweeper ──sweep─────────┘   └──stop──▶ ContainerRuntime (docker)
//!                                                   │
//!                              exit event ◀─────────┘
//! ```
//!
//! ## Modules
//!
//! - `resolver`: label overrides and computed fallbacks per container
//! - `network`: address of a container on a network shared with the controller
//! - `registry`: published backends and publish/drain/unpublish/stop/sweep
//! - `events`: lifecycle event consumer and startup reconciliation
//! - `sweeper`: periodic drain sweep
//! - `runtime`, `docker`: container runtime seam and Docker implementation
//! - `balancer`: load balancer seam and glbd implementation

pub mod balancer;
pub mod config;
pub mod container;
pub mod docker;
pub mod events;
pub mod network;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod sweeper;

// Re-export commonly used types
pub use balancer::{Backend, BalancerChannel, ControlEndpoint, GlbBalancer, MockBalancer, Weight};
pub use container::{ContainerDescriptor, RuntimeEvent};
pub use events::EventConsumer;
pub use registry::{BackendPhase, BackendRecord, Registry};
pub use runtime::{ContainerRuntime, MockRuntime};
pub use sweeper::DrainSweeper;
