//! zdlb controller
//!
//! Registers opted-in containers as glbd backends and drains them on
//! replacement.
//!
//! ## Architecture
//!
//! - **Event Consumer**: Maps container lifecycle events to registry operations
//! - **Drain Sweeper**: Stops containers whose backend is fully drained
//! - **Registry**: Tracks published backends, serialises every change

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use zdlb_controller::config::{self, Config};
use zdlb_controller::docker::DockerRuntime;
use zdlb_controller::network::SelfNetworks;
use zdlb_controller::runtime::ContainerRuntime;
use zdlb_controller::{DrainSweeper, EventConsumer, GlbBalancer, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to ZDLB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting zdlb controller");
    info!(
        default_glbctl_host = %config.defaults.glbctl_host,
        default_glbctl_port = config.defaults.glbctl_port,
        default_app_port = ?config.defaults.app_port,
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        stop_grace_secs = config.stop_grace.as_secs(),
        "Configuration loaded"
    );

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect().context("Failed to connect to docker")?);

    // The network matcher needs the controller's own attachments.
    let self_id = match &config.self_id {
        Some(id) => id.clone(),
        None => config::detect_self_id().await?,
    };
    let me = runtime
        .inspect(&self_id)
        .await
        .with_context(|| format!("Failed to inspect own container {self_id}"))?;
    info!(
        controller_id = %me.id,
        networks = ?me.networks.keys().collect::<Vec<_>>(),
        "Own container inspected"
    );

    let registry = Arc::new(Registry::new(
        config.defaults.clone(),
        SelfNetworks::new(me.id, me.networks),
        Arc::new(GlbBalancer::new()),
        Arc::clone(&runtime),
        config.stop_grace,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut consumer_handle = tokio::spawn({
        let consumer = EventConsumer::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            config.resubscribe_delay,
        );
        let shutdown_rx = shutdown_rx.clone();
        async move { consumer.run(shutdown_rx).await }
    });

    let mut sweeper_handle = tokio::spawn({
        let sweeper = DrainSweeper::new(Arc::clone(&registry), config.sweep_interval);
        let shutdown_rx = shutdown_rx.clone();
        async move { sweeper.run(shutdown_rx).await }
    });

    // Wait for shutdown signal
    let mut consumer_done = false;
    let mut sweeper_done = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut consumer_handle => {
            consumer_done = true;
            match result {
                Ok(()) => info!("Event consumer exited"),
                Err(e) => error!(error = %e, "Event consumer task panicked"),
            }
        }
        result = &mut sweeper_handle => {
            sweeper_done = true;
            match result {
                Ok(()) => info!("Drain sweeper exited"),
                Err(e) => error!(error = %e, "Drain sweeper task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !consumer_done {
        if let Err(e) = consumer_handle.await {
            error!(error = %e, "Event consumer failed during shutdown");
        }
    }
    if !sweeper_done {
        if let Err(e) = sweeper_handle.await {
            error!(error = %e, "Drain sweeper failed during shutdown");
        }
    }

    info!(
        tracked_backends = registry.len().await,
        "zdlb controller shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
