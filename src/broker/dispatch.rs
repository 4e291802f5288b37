//! Dispatch engine: fan one task out to every live connection and join the outcomes.

use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};

use super::ledger::TaskLedger;
use super::model::{CONNECTION_CLOSED_RESULT, Task, TaskStatus, TaskType, WsFrame};
use super::registry::ConnectionRegistry;
use crate::error::BrokerError;

/// Send a `task_type` task to every connection live right now and wait for all of them.
///
/// Returns one task per connection in the snapshot, in snapshot order. Worker
/// failures, timeouts and disconnects show up as per-task statuses; this never
/// fails as a whole. With no connections it returns immediately.
pub async fn dispatch(
    registry: &ConnectionRegistry,
    ledger: &TaskLedger,
    task_type: TaskType,
) -> Vec<Task> {
    let connections = registry.snapshot();
    if connections.is_empty() {
        info!(task_type = %task_type, "No worker connections, nothing to dispatch");
        return Vec::new();
    }

    info!(
        task_type = %task_type,
        connections = connections.len(),
        "Dispatching task to workers"
    );

    let mut waiters = Vec::with_capacity(connections.len());
    for connection in &connections {
        let (task, pending) = ledger.create_pending(connection.handle, task_type);
        let task_id = task.task_id.clone();

        if let Err(e) = connection.send(WsFrame::Task { data: task }) {
            warn!(
                handle = %connection.handle,
                task_id = %task_id,
                error = %e,
                "Failed to send task frame"
            );
            let reason = match e {
                BrokerError::ConnectionClosed { .. } => json!(CONNECTION_CLOSED_RESULT),
                e => json!(format!("send failed: {e}")),
            };
            ledger.resolve(&task_id, TaskStatus::Failed, reason);
        }
        waiters.push(pending.wait());
    }

    let results = join_all(waiters).await;

    let succeeded = results
        .iter()
        .filter(|t| t.status == TaskStatus::Success)
        .count();
    info!(
        task_type = %task_type,
        total = results.len(),
        succeeded,
        failed = results.len() - succeeded,
        "Dispatch round complete"
    );
    results
}
