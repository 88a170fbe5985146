use pylon_transport::TransportConfig;
use pylon_wire::DEFAULT_MAX_PAYLOAD_BYTES;
use std::time::Duration;

pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-session settings applied by the acceptor. A zero `read_timeout`
/// disables read-timeout events.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub read_timeout: Duration,
    pub echo_heartbeats: bool,
    pub outbound_queue_depth: usize,
    pub max_payload_bytes: usize,
    pub nodelay: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            echo_heartbeats: true,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            nodelay: true,
        }
    }
}

impl BrokerConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_payload_bytes: self.max_payload_bytes,
            nodelay: self.nodelay,
        }
    }
}
