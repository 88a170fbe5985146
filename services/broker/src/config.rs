use anyhow::{Context, Result};
use pylon_broker::BrokerConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Broker daemon configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // TCP listener bind address for clients.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Fan client publishes out to every subscribed session.
    pub relay: bool,
    // Per-session settings handed to the acceptor.
    pub broker: BrokerConfig,
}

const DEFAULT_BIND: &str = "0.0.0.0:7400";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Default, Deserialize)]
struct ServiceConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    relay: Option<bool>,
    read_timeout_ms: Option<u64>,
    echo_heartbeats: Option<bool>,
    outbound_queue_depth: Option<usize>,
    max_payload_bytes: Option<usize>,
    nodelay: Option<bool>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("PYLON_BROKER_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse PYLON_BROKER_BIND")?;
        let metrics_bind = std::env::var("PYLON_BROKER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse PYLON_BROKER_METRICS_BIND")?;
        let relay = env_flag("PYLON_BROKER_RELAY").unwrap_or(true);

        let mut broker = BrokerConfig::default();
        // Zero is meaningful here: it turns read-timeout events off.
        if let Some(value) = env_parse::<u64>("PYLON_BROKER_READ_TIMEOUT_MS") {
            broker.read_timeout = Duration::from_millis(value);
        }
        if let Some(value) = env_flag("PYLON_BROKER_ECHO_HEARTBEATS") {
            broker.echo_heartbeats = value;
        }
        if let Some(value) = env_parse::<usize>("PYLON_BROKER_OUTBOUND_QUEUE_DEPTH")
            .filter(|value| *value > 0)
        {
            broker.outbound_queue_depth = value;
        }
        if let Some(value) =
            env_parse::<usize>("PYLON_MAX_PAYLOAD_BYTES").filter(|value| *value > 0)
        {
            broker.max_payload_bytes = value;
        }
        if let Some(value) = env_flag("PYLON_TCP_NODELAY") {
            broker.nodelay = value;
        }
        Ok(Self {
            bind,
            metrics_bind,
            relay,
            broker,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("PYLON_BROKER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read PYLON_BROKER_CONFIG: {path}"))?;
            let override_cfg: ServiceConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: ServiceConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.bind {
            self.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.relay {
            self.relay = value;
        }
        if let Some(value) = override_cfg.read_timeout_ms {
            self.broker.read_timeout = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.echo_heartbeats {
            self.broker.echo_heartbeats = value;
        }
        if let Some(value) = override_cfg.outbound_queue_depth
            && value > 0
        {
            self.broker.outbound_queue_depth = value;
        }
        if let Some(value) = override_cfg.max_payload_bytes
            && value > 0
        {
            self.broker.max_payload_bytes = value;
        }
        if let Some(value) = override_cfg.nodelay {
            self.broker.nodelay = value;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}
