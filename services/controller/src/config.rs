//! Controller configuration.
//!
//! Environment variables provide the defaults used when a container does
//! not override them with labels.

use std::time::Duration;

use anyhow::{Context, Result};

/// Lower bound for the drain sweep period.
const MIN_SWEEP_INTERVAL_MS: u64 = 100;

/// Container labels recognised by the controller.
pub mod labels {
    /// Opt-in marker. Only containers carrying it are considered.
    pub const ENABLED: &str = "zdlb.enabled";
    pub const GLBCTL_HOST: &str = "zdlb.glbctl.host";
    pub const GLBCTL_PORT: &str = "zdlb.glbctl.port";
    pub const APP_ID: &str = "zdlb.app.id";
    pub const APP_PORT: &str = "zdlb.app.port";
    pub const APP_DEPLOY: &str = "zdlb.app.deploy";
}

/// Fallbacks for per-container registration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    /// Load balancer control host.
    pub glbctl_host: String,

    /// Load balancer control port.
    pub glbctl_port: u16,

    /// Backend port when the container exposes no TCP port.
    pub app_port: Option<u16>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            glbctl_host: "glbd".to_string(),
            glbctl_port: 4444,
            app_port: None,
        }
    }
}

/// Controller configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    pub defaults: Defaults,

    /// Period of the drain sweep.
    pub sweep_interval: Duration,

    /// Grace period passed to container stop.
    pub stop_grace: Duration,

    /// Delay before re-subscribing after the event stream ends.
    pub resubscribe_delay: Duration,

    /// Id or name of the controller's own container. Resolved from the
    /// hostname when unset.
    pub self_id: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            sweep_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            resubscribe_delay: Duration::from_secs(1),
            self_id: None,
            log_level: "info".to_string(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_var<T, F>(lookup: &F, name: &str, what: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup(name))
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {what}."))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();

        let glbctl_host = non_empty(lookup("AUTOGLBD_DEFAULT_GLBCTL_HOST"))
            .map(|v| v.trim().to_string())
            .unwrap_or(base.defaults.glbctl_host);

        let glbctl_port: u16 =
            parse_var(&lookup, "AUTOGLBD_DEFAULT_GLBCTL_PORT", "a TCP port")?
                .unwrap_or(base.defaults.glbctl_port);

        let app_port: Option<u16> =
            parse_var::<u16, _>(&lookup, "AUTOGLBD_DEFAULT_APP_PORT", "a TCP port")?
                .filter(|p| *p > 0);

        let sweep_interval_ms: u64 =
            parse_var(&lookup, "ZDLB_SWEEP_INTERVAL_MS", "an integer (milliseconds)")?
                .unwrap_or(5000);
        let sweep_interval = Duration::from_millis(sweep_interval_ms.max(MIN_SWEEP_INTERVAL_MS));

        let stop_grace_secs: u64 =
            parse_var(&lookup, "ZDLB_STOP_GRACE_SECS", "an integer (seconds)")?.unwrap_or(5);

        let resubscribe_delay_ms: u64 =
            parse_var(&lookup, "ZDLB_RESUBSCRIBE_DELAY_MS", "an integer (milliseconds)")?
                .unwrap_or(1000);

        let self_id = non_empty(lookup("ZDLB_SELF_ID")).map(|v| v.trim().to_string());

        let log_level = non_empty(lookup("ZDLB_LOG_LEVEL")).unwrap_or(base.log_level);

        Ok(Self {
            defaults: Defaults {
                glbctl_host,
                glbctl_port,
                app_port,
            },
            sweep_interval,
            stop_grace: Duration::from_secs(stop_grace_secs),
            resubscribe_delay: Duration::from_millis(resubscribe_delay_ms),
            self_id,
            log_level,
        })
    }
}

/// Best guess at the controller's own container: `$HOSTNAME`, then `/etc/hostname`.
pub async fn detect_self_id() -> Result<String> {
    if let Some(hostname) = std::env::var("HOSTNAME")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        return Ok(hostname.trim().to_string());
    }

    let raw = tokio::fs::read_to_string("/etc/hostname")
        .await
        .context("Cannot determine own container: set ZDLB_SELF_ID or HOSTNAME")?;
    let hostname = raw.trim();
    if hostname.is_empty() {
        anyhow::bail!("/etc/hostname is empty; set ZDLB_SELF_ID");
    }
    Ok(hostname.to_string())
}
