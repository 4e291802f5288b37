//! Error types for the task broker.

use std::net::SocketAddr;

use crate::broker::model::ConnectionHandle;

/// Top-level error type for the broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Broker runtime errors.
///
/// None of these reach a `dispatch` caller; send failures are folded into the
/// affected task as a `failed` result.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to send frame to {handle}: {reason}")]
    SendFailed {
        handle: ConnectionHandle,
        reason: String,
    },

    #[error("Connection {handle} is closed")]
    ConnectionClosed { handle: ConnectionHandle },

    #[error("Broker is shutting down")]
    ShuttingDown,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Result type alias for the broker.
pub type Result<T> = std::result::Result<T, Error>;
