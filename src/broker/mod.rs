//! Task broker: worker connections, heartbeats, pending tasks, and fan-out dispatch.

pub mod dispatch;
pub mod heartbeat;
pub mod ledger;
pub mod model;
pub mod registry;
pub mod ws;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use heartbeat::HeartbeatSupervisor;
use ledger::TaskLedger;
use model::{
    ConnectionHandle, ConnectionInfo, ConnectionsReport, READY_STATE_CLOSING, READY_STATE_OPEN,
    Task, TaskType, WsFrame,
};
use registry::{ConnectionRegistry, WorkerTransport};

/// Remove a connection and fail whatever it still owes.
///
/// Shared by eviction, transport close and shutdown.
pub(crate) fn close_connection(
    registry: &ConnectionRegistry,
    ledger: &TaskLedger,
    handle: ConnectionHandle,
) -> usize {
    registry.unregister(handle);
    ledger.fail_all_for_connection(handle)
}

/// Process-wide broker state. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<TaskLedger>,
    config: Arc<BrokerConfig>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            ledger: TaskLedger::new(config.task_timeout),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Register a newly accepted worker transport.
    ///
    /// Refused once [`Broker::close_all`] has run.
    pub fn accept(&self, transport: WorkerTransport) -> Result<ConnectionHandle, BrokerError> {
        self.registry.register(transport)
    }

    /// Unregister `handle` and fail its pending tasks. Safe to call repeatedly.
    pub fn close_connection(&self, handle: ConnectionHandle) -> usize {
        close_connection(&self.registry, &self.ledger, handle)
    }

    /// Apply one parsed inbound frame from `handle`.
    pub fn handle_frame(&self, handle: ConnectionHandle, frame: WsFrame) {
        match frame {
            WsFrame::Heartbeat => self.registry.touch(handle),
            WsFrame::Task { data } => {
                debug!(handle = %handle, task_id = %data.task_id, status = %data.status, "Task result received");
                self.ledger.resolve_from_worker(handle, data);
            }
        }
    }

    /// Fan a task out to every live worker and wait for all outcomes.
    pub async fn dispatch(&self, task_type: TaskType) -> Vec<Task> {
        dispatch::dispatch(&self.registry, &self.ledger, task_type).await
    }

    /// Read-only diagnostic view of the live connections.
    pub fn connections_snapshot(&self) -> ConnectionsReport {
        let now = Instant::now();
        let per_connection: Vec<ConnectionInfo> = self
            .registry
            .snapshot()
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let silence = entry.silence(now);
                ConnectionInfo {
                    index: i + 1,
                    handle: entry.handle,
                    last_heartbeat_at: entry.last_heartbeat_at,
                    millis_since_heartbeat: silence.as_millis() as u64,
                    alive: silence <= self.config.heartbeat_timeout,
                    ready_state: if entry.transport.is_open() {
                        READY_STATE_OPEN
                    } else {
                        READY_STATE_CLOSING
                    },
                    pending_task_count: self.ledger.pending_count_for(entry.handle),
                }
            })
            .collect();

        ConnectionsReport {
            total: per_connection.len(),
            per_connection,
        }
    }

    /// Start the heartbeat supervisor on the configured tick.
    pub fn spawn_heartbeat_supervisor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        HeartbeatSupervisor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
        )
        .spawn(cancel)
    }

    /// Close every connection, failing all of their pending tasks, and stop
    /// accepting new ones.
    ///
    /// Returns the number of connections closed.
    pub fn close_all(&self) -> usize {
        let handles = self.registry.close_all();
        let failed: usize = handles
            .iter()
            .map(|handle| self.ledger.fail_all_for_connection(*handle))
            .sum();
        info!(connections = handles.len(), failed_tasks = failed, "Closed all worker connections");
        handles.len()
    }
}
