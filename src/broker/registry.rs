//! Connection registry: the set of live worker connections, keyed by handle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::model::{ConnectionHandle, WsFrame};
use crate::error::BrokerError;

/// Broker-side end of a worker's duplex socket.
///
/// Outbound frames go into a bounded queue drained by the socket loop in
/// [`super::ws`]. Cancelling `close` tells that loop to close the socket.
#[derive(Debug, Clone)]
pub struct WorkerTransport {
    tx: mpsc::Sender<WsFrame>,
    close: CancellationToken,
}

impl WorkerTransport {
    pub fn new(tx: mpsc::Sender<WsFrame>, close: CancellationToken) -> Self {
        Self { tx, close }
    }

    /// Create a transport plus the receiving half the socket loop drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WsFrame>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let close = CancellationToken::new();
        (Self::new(tx, close.clone()), rx, close)
    }

    pub fn is_open(&self) -> bool {
        !self.close.is_cancelled() && !self.tx.is_closed()
    }

    fn close(&self) {
        self.close.cancel();
    }
}

/// A registered connection.
#[derive(Debug)]
struct Connection {
    transport: WorkerTransport,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
}

impl Connection {
    fn entry(&self, handle: ConnectionHandle) -> ConnectionEntry {
        ConnectionEntry {
            handle,
            transport: self.transport.clone(),
            last_heartbeat: self.last_heartbeat,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }
}

/// Point-in-time copy of one registry entry.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub handle: ConnectionHandle,
    pub transport: WorkerTransport,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ConnectionEntry {
    /// Queue a frame for this connection without waiting.
    pub fn send(&self, frame: WsFrame) -> Result<(), BrokerError> {
        if self.transport.close.is_cancelled() {
            return Err(BrokerError::ConnectionClosed {
                handle: self.handle,
            });
        }
        self.transport.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::SendFailed {
                handle: self.handle,
                reason: "outbound queue full".to_string(),
            },
            TrySendError::Closed(_) => BrokerError::ConnectionClosed {
                handle: self.handle,
            },
        })
    }

    /// Time since the last heartbeat, measured against `now`.
    pub fn silence(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Registry of live worker connections.
///
/// Entries are ordered by handle, which is also registration order. Once
/// [`ConnectionRegistry::close_all`] has run the registry stays closed and
/// refuses new registrations.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: BTreeMap<ConnectionHandle, Connection>,
    closed: bool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly accepted transport under a new handle.
    ///
    /// Fails with [`BrokerError::ShuttingDown`] after `close_all`; the
    /// transport is closed in that case.
    pub fn register(&self, transport: WorkerTransport) -> Result<ConnectionHandle, BrokerError> {
        let handle = ConnectionHandle::next();
        let total = {
            let mut inner = self.inner.lock();
            if inner.closed {
                transport.close();
                debug!(handle = %handle, "Registry closed, refusing connection");
                return Err(BrokerError::ShuttingDown);
            }
            inner.connections.insert(
                handle,
                Connection {
                    transport,
                    last_heartbeat: Instant::now(),
                    last_heartbeat_at: Utc::now(),
                },
            );
            inner.connections.len()
        };
        info!(handle = %handle, total, "Worker connection registered");
        Ok(handle)
    }

    /// Close and remove a connection. Unknown or already-removed handles are a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, handle: ConnectionHandle) -> bool {
        let removed = self.inner.lock().connections.remove(&handle);
        match removed {
            Some(connection) => {
                connection.transport.close();
                info!(handle = %handle, "Worker connection unregistered");
                true
            }
            None => {
                debug!(handle = %handle, "Unregister for unknown connection ignored");
                false
            }
        }
    }

    /// Close the registry and every connection in it.
    ///
    /// Marking the registry closed and draining it happen under one lock, so
    /// no registration can slip in afterwards. Returns the removed handles.
    pub fn close_all(&self) -> Vec<ConnectionHandle> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.connections)
        };
        for connection in drained.values() {
            connection.transport.close();
        }
        info!(connections = drained.len(), "Connection registry closed");
        drained.into_keys().collect()
    }

    /// Record a heartbeat from `handle`. No-op if the handle is unknown.
    pub fn touch(&self, handle: ConnectionHandle) {
        if let Some(connection) = self.inner.lock().connections.get_mut(&handle) {
            connection.last_heartbeat = Instant::now();
            connection.last_heartbeat_at = Utc::now();
        }
    }

    /// Copy of every entry at this instant, in registration order.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.inner
            .lock()
            .connections
            .iter()
            .map(|(handle, c)| c.entry(*handle))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, handle: ConnectionHandle) -> Option<ConnectionEntry> {
        self.inner
            .lock()
            .connections
            .get(&handle)
            .map(|c| c.entry(handle))
    }

    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.inner.lock().connections.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }
}
