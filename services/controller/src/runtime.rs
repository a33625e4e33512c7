//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the container engine operations the
//! controller depends on:
//! - Subscribing to container lifecycle events
//! - Listing and inspecting labeled containers
//! - Stopping containers
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::container::{ContainerDescriptor, RuntimeEvent};

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Api(String),

    #[error("event stream error: {0}")]
    Stream(String),
}

/// Live, non-restartable sequence of lifecycle events.
///
/// Dropping the stream closes the underlying subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent, RuntimeError>> + Send>>;

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The container was already gone.
    NotFound,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Subscribe to container events for containers carrying `label`.
    async fn subscribe(&self, label: &str) -> Result<EventStream, RuntimeError>;

    /// Ids of running containers carrying `label`.
    async fn list_running(&self, label: &str) -> Result<Vec<String>, RuntimeError>;

    /// Inspect a single container.
    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor, RuntimeError>;

    /// Stop a container, waiting at most `grace` before it is killed.
    async fn stop(&self, id: &str, grace: Duration) -> Result<StopOutcome, RuntimeError>;
}

type Subscriber = mpsc::UnboundedSender<Result<RuntimeEvent, RuntimeError>>;

#[derive(Default)]
struct MockState {
    containers: HashMap<String, ContainerDescriptor>,
    running: HashSet<String>,
    broken: HashSet<String>,
    stops: Vec<String>,
    subscribers: Vec<Subscriber>,
    subscriptions: usize,
    fail_stops: bool,
}

/// In-memory runtime for tests and development.
///
/// `stop` marks the container as exited and emits a `die` event to every
/// live subscription, like a real engine would.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Create an empty mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a running container.
    pub fn add_container(&self, container: ContainerDescriptor) {
        let mut state = self.state();
        state.running.insert(container.id.clone());
        state.containers.insert(container.id.clone(), container);
    }

    /// Replace a container's descriptor without changing its running state.
    pub fn update_container(&self, container: ContainerDescriptor) {
        self.state()
            .containers
            .insert(container.id.clone(), container);
    }

    /// Mark a container as exited (it stays inspectable).
    pub fn mark_exited(&self, id: &str) {
        self.state().running.remove(id);
    }

    /// Make `inspect` fail for a container.
    pub fn break_inspect(&self, id: &str) {
        self.state().broken.insert(id.to_string());
    }

    /// Make every `stop` call fail.
    pub fn fail_stops(&self, fail: bool) {
        self.state().fail_stops = fail;
    }

    /// Ids passed to `stop`, in call order.
    pub fn stop_calls(&self) -> Vec<String> {
        self.state().stops.clone()
    }

    /// Number of `subscribe` calls so far.
    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions
    }

    /// Deliver an event to every live subscription.
    pub fn emit(&self, event: RuntimeEvent) {
        self.state()
            .subscribers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Deliver a stream error to every live subscription.
    pub fn emit_error(&self, message: &str) {
        self.state()
            .subscribers
            .retain(|tx| tx.send(Err(RuntimeError::Stream(message.to_string()))).is_ok());
    }

    /// End every live subscription.
    pub fn close_streams(&self) {
        self.state().subscribers.clear();
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn subscribe(&self, label: &str) -> Result<EventStream, RuntimeError> {
        debug!(label, "[MOCK] Subscribing to events");

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            state.subscribers.push(tx);
            state.subscriptions += 1;
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn list_running(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let state = self.state();
        let mut ids: Vec<String> = state
            .running
            .iter()
            .filter(|id| {
                state
                    .containers
                    .get(*id)
                    .is_some_and(|c| c.has_label(label))
            })
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor, RuntimeError> {
        let state = self.state();
        if state.broken.contains(id) {
            return Err(RuntimeError::Api(format!("[MOCK] inspect failed for {id}")));
        }
        state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<StopOutcome, RuntimeError> {
        let mut state = self.state();
        state.stops.push(id.to_string());

        if state.fail_stops {
            return Err(RuntimeError::Api("[MOCK] runtime configured to fail".to_string()));
        }

        if !state.containers.contains_key(id) {
            return Ok(StopOutcome::NotFound);
        }

        info!(
            container_id = %id,
            grace_secs = grace.as_secs(),
            "[MOCK] Stopping container"
        );

        if state.running.remove(id) {
            let event = RuntimeEvent::new(id, "die");
            state
                .subscribers
                .retain(|tx| tx.send(Ok(event.clone())).is_ok());
        }

        Ok(StopOutcome::Stopped)
    }
}
