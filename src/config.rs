//! Configuration types.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Ratio of dead threshold to heartbeat tick below which jitter can cause false evictions.
const MIN_SAFE_DEAD_RATIO: u32 = 3;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address both listeners bind to.
    pub bind_addr: IpAddr,
    /// Port of the worker WebSocket listener.
    pub ws_port: u16,
    /// Route the worker WebSocket is served on.
    pub ws_path: String,
    /// Port of the HTTP status/dispatch API.
    pub http_port: u16,
    /// Heartbeat supervisor tick.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is evicted.
    pub heartbeat_timeout: Duration,
    /// How long a dispatched task may stay pending before it resolves as timed out.
    pub task_timeout: Duration,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
    /// Upper bound on waiting for the listeners to drain at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ws_port: 3101,
            ws_path: "/ws".to_string(),
            http_port: 3100,
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(3000),
            task_timeout: Duration::from_secs(180), // 3 minutes
            outbound_buffer: 64,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.ws_port)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.http_port)
    }

    /// Reject settings the broker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ws_path.starts_with('/') {
            return Err(invalid("ws_path", format!("must start with '/', got {:?}", self.ws_path)));
        }
        for (key, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("task_timeout", self.task_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero".to_string()));
            }
        }
        if self.outbound_buffer == 0 {
            return Err(invalid("outbound_buffer", "must be greater than zero".to_string()));
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(invalid(
                "heartbeat_timeout",
                format!(
                    "{:?} is shorter than the heartbeat interval {:?}",
                    self.heartbeat_timeout, self.heartbeat_interval
                ),
            ));
        }
        if self.heartbeat_timeout < self.heartbeat_interval * MIN_SAFE_DEAD_RATIO {
            warn!(
                interval_ms = self.heartbeat_interval.as_millis() as u64,
                timeout_ms = self.heartbeat_timeout.as_millis() as u64,
                "Heartbeat timeout is less than 3 ticks; scheduling jitter may evict live workers"
            );
        }
        Ok(())
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}
