// Client-side defaults and environment/YAML configuration.
use anyhow::{Context, Result};
use pylon_transport::TransportConfig;
use pylon_wire::DEFAULT_MAX_PAYLOAD_BYTES;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub(crate) const DEFAULT_ADDR: &str = "127.0.0.1:7400";
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_LOGOUT_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for one [`ClientSession`](crate::ClientSession).
///
/// A zero duration disables the timer it drives: no heartbeats, no read
/// timeout, no automatic reconnect, no connect deadline, no logout wait.
///
/// ```
/// use pylon_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     addr: "127.0.0.1:7400".to_string(),
///     heartbeat_interval: Duration::from_millis(50),
///     ..ClientConfig::default()
/// };
/// assert!(config.reconnect_max_delay >= config.reconnect_delay);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: String,
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub connect_timeout: Duration,
    pub logout_timeout: Duration,
    pub max_payload_bytes: usize,
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            logout_timeout: DEFAULT_LOGOUT_TIMEOUT,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            nodelay: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    addr: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    logout_timeout_ms: Option<u64>,
    max_payload_bytes: Option<usize>,
    nodelay: Option<bool>,
}

impl ClientConfig {
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Environment first, then an optional YAML file on top (`config_path`, or
    /// `PYLON_CLIENT_CONFIG` when no path is given).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("PYLON_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("PYLON_CLIENT_ADDR")
            && !value.is_empty()
        {
            config.addr = value;
        }
        if let Some(value) = read_millis_env("PYLON_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = value;
        }
        if let Some(value) = read_millis_env("PYLON_READ_TIMEOUT_MS") {
            config.read_timeout = value;
        }
        if let Some(value) = read_millis_env("PYLON_RECONNECT_DELAY_MS") {
            config.reconnect_delay = value;
        }
        if let Some(value) = read_millis_env("PYLON_RECONNECT_MAX_DELAY_MS") {
            config.reconnect_max_delay = value;
        }
        if let Some(value) = read_millis_env("PYLON_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = value;
        }
        if let Some(value) = read_millis_env("PYLON_LOGOUT_TIMEOUT_MS") {
            config.logout_timeout = value;
        }
        if let Some(value) = read_usize_env("PYLON_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = value;
        }
        if let Some(value) = read_bool_env("PYLON_TCP_NODELAY") {
            config.nodelay = value;
        }
        config
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_payload_bytes: self.max_payload_bytes,
            nodelay: self.nodelay,
        }
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = &self.addr
            && !value.is_empty()
        {
            config.addr = value.clone();
        }
        if let Some(value) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.read_timeout_ms {
            config.read_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.reconnect_delay_ms {
            config.reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.reconnect_max_delay_ms {
            config.reconnect_max_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.logout_timeout_ms {
            config.logout_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.max_payload_bytes
            && value > 0
        {
            config.max_payload_bytes = value;
        }
        if let Some(value) = self.nodelay {
            config.nodelay = value;
        }
    }
}

// Zero is meaningful for durations (it disables the timer), so it is kept.
fn read_millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
