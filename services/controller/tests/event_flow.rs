//! Integration tests for the event-driven registration flow.
//!
//! These tests run the event consumer and drain sweeper against the mock
//! runtime and balancer:
//! 1. Running containers are published at startup
//! 2. Lifecycle events publish and unpublish backends
//! 3. A new deploy drains the old one, which is stopped once idle and
//!    unpublished by its own exit event

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use zdlb_controller::balancer::WeightCall;
use zdlb_controller::config::{labels, Defaults};
use zdlb_controller::container::{ContainerDescriptor, ExposedPort, HealthState};
use zdlb_controller::network::SelfNetworks;
use zdlb_controller::{
    Backend, BackendPhase, ControlEndpoint, DrainSweeper, EventConsumer, MockBalancer,
    MockRuntime, Registry, RuntimeEvent, Weight,
};

struct Harness {
    registry: Arc<Registry>,
    balancer: Arc<MockBalancer>,
    runtime: Arc<MockRuntime>,
    consumer: Arc<EventConsumer>,
}

fn harness() -> Harness {
    let balancer = Arc::new(MockBalancer::new());
    let runtime = Arc::new(MockRuntime::new());
    let registry = Arc::new(Registry::new(
        Defaults::default(),
        SelfNetworks::new(
            "zdlb",
            BTreeMap::from([
                ("edge".to_string(), "10.0.0.2".to_string()),
                ("internal".to_string(), "10.1.0.2".to_string()),
            ]),
        ),
        balancer.clone(),
        runtime.clone(),
        Duration::from_secs(5),
    ));
    let consumer = Arc::new(EventConsumer::new(
        runtime.clone(),
        Arc::clone(&registry),
        Duration::from_millis(10),
    ));
    Harness {
        registry,
        balancer,
        runtime,
        consumer,
    }
}

fn web(id: &str, deploy: &str, ip: &str) -> ContainerDescriptor {
    ContainerDescriptor {
        id: id.to_string(),
        image: format!("registry.local/web:{deploy}"),
        labels: HashMap::from([(labels::ENABLED.to_string(), "true".to_string())]),
        exposed_ports: vec![ExposedPort::tcp(8080)],
        networks: BTreeMap::from([("edge".to_string(), ip.to_string())]),
        health: None,
        ..Default::default()
    }
}

fn glbd() -> ControlEndpoint {
    ControlEndpoint::new("glbd", 4444)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn spawn_consumer(h: &Harness) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let consumer = Arc::clone(&h.consumer);
    let handle = tokio::spawn(async move { consumer.run(rx).await });
    (tx, handle)
}

#[tokio::test]
async fn test_startup_sweep_publishes_running_containers() {
    let h = &harness();
    h.runtime.add_container(web("a", "v1", "10.0.0.5"));
    h.runtime.add_container(web("b", "v1", "10.0.0.6"));
    h.runtime.add_container(web("broken", "v1", "10.0.0.7"));
    h.runtime.break_inspect("broken");
    let mut starting = web("starting", "v1", "10.0.0.8");
    starting.health = Some(HealthState::Starting);
    h.runtime.add_container(starting);
    let mut unhealthy = web("unhealthy", "v1", "10.0.0.9");
    unhealthy.health = Some(HealthState::Unhealthy);
    h.runtime.add_container(unhealthy);

    let report = h.consumer.reconcile_running(false).await;

    assert_eq!(report.published, 2);
    assert_eq!(report.failed, 1);
    // Not ready yet; a later healthy event publishes them.
    assert_eq!(report.skipped, 2);
    let ids: Vec<String> = h
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|r| r.container_id)
        .collect();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_start_and_die_events() {
    let h = &harness();
    let (shutdown, task) = spawn_consumer(h);
    eventually("subscription", || async move { h.runtime.subscription_count() == 1 }).await;

    h.runtime.add_container(web("c1", "v1", "10.0.0.5"));
    h.runtime.emit(RuntimeEvent::new("c1", "start"));
    eventually("publish", || async move { h.registry.get("c1").await.is_some() }).await;

    h.runtime.mark_exited("c1");
    h.runtime.emit(RuntimeEvent::new("c1", "die"));
    eventually("unpublish", || async move { h.registry.is_empty().await }).await;

    assert_eq!(
        h.balancer.weights_for(&Backend::new("10.0.0.5", 8080)),
        vec![Weight::InService, Weight::Removed]
    );

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unhealthy_start_waits_for_health_event() {
    let h = &harness();
    let (shutdown, task) = spawn_consumer(h);
    eventually("subscription", || async move { h.runtime.subscription_count() == 1 }).await;

    let mut c = web("c1", "v1", "10.0.0.5");
    c.health = Some(HealthState::Starting);
    h.runtime.add_container(c.clone());
    h.runtime.emit(RuntimeEvent::new("c1", "start"));

    // Events are handled in order: once "marker" is published, the start
    // of "c1" has been handled too.
    h.runtime.add_container(web("marker", "v1", "10.0.0.9"));
    h.runtime.emit(RuntimeEvent::new("marker", "start"));
    eventually("marker", || async move { h.registry.get("marker").await.is_some() }).await;
    assert!(h.registry.get("c1").await.is_none());

    c.health = Some(HealthState::Healthy);
    h.runtime.update_container(c);
    h.runtime.emit(RuntimeEvent::new("c1", "health_status: healthy"));
    eventually("publish", || async move { h.registry.get("c1").await.is_some() }).await;

    assert_eq!(
        h.balancer.weights_for(&Backend::new("10.0.0.5", 8080)),
        vec![Weight::InService]
    );

    h.runtime.emit(RuntimeEvent::new("c1", "health_status: unhealthy"));
    eventually("unpublish", || async move { h.registry.get("c1").await.is_none() }).await;

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_event_errors_do_not_stop_the_stream() {
    let h = &harness();
    let (shutdown, task) = spawn_consumer(h);
    eventually("subscription", || async move { h.runtime.subscription_count() == 1 }).await;

    // Unknown container: inspect fails.
    h.runtime.emit(RuntimeEvent::new("ghost", "start"));
    // No exposed port: resolution fails.
    let mut portless = web("portless", "v1", "10.0.0.4");
    portless.exposed_ports.clear();
    h.runtime.add_container(portless);
    h.runtime.emit(RuntimeEvent::new("portless", "start"));

    h.runtime.add_container(web("ok", "v1", "10.0.0.5"));
    h.runtime.emit(RuntimeEvent::new("ok", "start"));
    eventually("publish", || async move { h.registry.get("ok").await.is_some() }).await;

    assert_eq!(h.registry.len().await, 1);
    assert_eq!(
        h.balancer.calls(),
        vec![WeightCall {
            endpoint: glbd(),
            backend: Backend::new("10.0.0.5", 8080),
            weight: Weight::InService,
        }]
    );

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_rolling_deploy_closes_the_loop() {
    let h = &harness();
    let (shutdown, task) = spawn_consumer(h);
    eventually("subscription", || async move { h.runtime.subscription_count() == 1 }).await;
    let sweeper = DrainSweeper::new(Arc::clone(&h.registry), Duration::from_millis(20));

    h.runtime.add_container(web("old", "v1", "10.0.0.5"));
    h.runtime.emit(RuntimeEvent::new("old", "start"));
    eventually("old published", || async move { h.registry.get("old").await.is_some() }).await;

    h.runtime.add_container(web("new", "v2", "10.0.0.6"));
    h.runtime.emit(RuntimeEvent::new("new", "start"));
    eventually("old draining", || async move {
        h.registry
            .get("old")
            .await
            .is_some_and(|r| r.phase == BackendPhase::Draining)
    })
    .await;

    // Still serving a client: nothing to stop yet.
    let old_backend = Backend::new("10.0.0.5", 8080);
    h.balancer.set_connections(&glbd(), &old_backend, 1);
    assert!(sweeper.sweep_once().await.stopped.is_empty());

    // Last connection closed: the sweep stops the container, its exit event
    // unpublishes it.
    h.balancer.set_connections(&glbd(), &old_backend, 0);
    assert_eq!(sweeper.sweep_once().await.stopped, vec!["old".to_string()]);
    eventually("old unpublished", || async move { h.registry.get("old").await.is_none() }).await;

    assert_eq!(
        h.balancer.weights_for(&old_backend),
        vec![Weight::InService, Weight::Draining, Weight::Removed]
    );
    assert_eq!(
        h.balancer.weights_for(&Backend::new("10.0.0.6", 8080)),
        vec![Weight::InService]
    );
    assert_eq!(h.runtime.stop_calls(), vec!["old".to_string()]);

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_resubscribe_prunes_missed_exits() {
    let h = &harness();
    h.runtime.add_container(web("a", "v1", "10.0.0.5"));
    h.runtime.add_container(web("b", "v1", "10.0.0.6"));

    let (shutdown, task) = spawn_consumer(h);
    eventually("startup publish", || async move { h.registry.len().await == 2 }).await;

    // "b" exits while the stream is down.
    h.runtime.emit_error("connection reset");
    h.runtime.mark_exited("b");
    eventually("resubscribe", || async move { h.runtime.subscription_count() >= 2 }).await;
    eventually("prune", || async move { h.registry.get("b").await.is_none() }).await;

    assert!(h.registry.get("a").await.is_some());
    // "a" was already tracked; the resync did not publish it twice.
    assert_eq!(
        h.balancer.weights_for(&Backend::new("10.0.0.5", 8080)),
        vec![Weight::InService]
    );

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_while_idle() {
    let h = &harness();
    let (shutdown, task) = spawn_consumer(h);
    eventually("subscription", || async move { h.runtime.subscription_count() == 1 }).await;

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("consumer did not stop")
        .unwrap();
}
