//! Task broker: fans tasks out to connected worker agents over WebSocket.

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod server;
