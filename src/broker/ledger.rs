//! Task ledger: in-flight (connection, task) pairs and their resolution.
//!
//! Every pending entry is resolved exactly once. The three triggers (a worker
//! result, the per-task timer, the owning connection closing) all funnel into
//! removing the entry from the pending map under one lock; whoever removes it
//! completes the waiter, and everyone after finds nothing and returns.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::{
    CONNECTION_CLOSED_RESULT, ConnectionHandle, TIMEOUT_RESULT, Task, TaskStatus, TaskType,
};

/// Broker-side bookkeeping for one task sent to one connection.
struct PendingEntry {
    handle: ConnectionHandle,
    task: Task,
    completion: oneshot::Sender<Task>,
    timer: JoinHandle<()>,
}

/// Awaitable side of a pending entry.
#[derive(Debug)]
pub struct PendingTask {
    task: Task,
    rx: oneshot::Receiver<Task>,
}

impl PendingTask {
    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    /// Wait for the entry to resolve.
    ///
    /// If the ledger is dropped with the entry still pending, the task comes
    /// back as failed.
    pub async fn wait(self) -> Task {
        let PendingTask { task, rx } = self;
        match rx.await {
            Ok(resolved) => resolved,
            Err(_) => task.settle(TaskStatus::Failed, json!(CONNECTION_CLOSED_RESULT)),
        }
    }
}

/// Sole owner of all pending entries.
pub struct TaskLedger {
    pending: Mutex<HashMap<String, PendingEntry>>,
    task_timeout: Duration,
    this: Weak<TaskLedger>,
}

impl TaskLedger {
    pub fn new(task_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            pending: Mutex::new(HashMap::new()),
            task_timeout,
            this: this.clone(),
        })
    }

    /// Record a new pending task for `handle` and arm its timeout.
    pub fn create_pending(&self, handle: ConnectionHandle, task_type: TaskType) -> (Task, PendingTask) {
        let task = Task::new(task_type);
        let (completion, rx) = oneshot::channel();

        let task_id = task.task_id.clone();
        let ledger = self.this.clone();
        let deadline = tokio::time::Instant::now() + self.task_timeout;

        let mut pending = self.pending.lock();
        // Spawned under the lock so the timer can never observe a missing entry.
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(ledger) = ledger.upgrade() {
                ledger.resolve(&task_id, TaskStatus::Timeout, json!(TIMEOUT_RESULT));
            }
        });
        pending.insert(
            task.task_id.clone(),
            PendingEntry {
                handle,
                task: task.clone(),
                completion,
                timer,
            },
        );
        drop(pending);

        debug!(handle = %handle, task_id = %task.task_id, task_type = %task_type, "Task pending");
        (task.clone(), PendingTask { task, rx })
    }

    /// Settle a pending task. Unknown or already-settled ids are a silent no-op.
    ///
    /// Returns whether this call did the settling.
    pub fn resolve(&self, task_id: &str, status: TaskStatus, result: Value) -> bool {
        if !status.is_terminal() {
            warn!(task_id = %task_id, "Refusing to resolve task back to pending");
            return false;
        }
        let entry = self.pending.lock().remove(task_id);
        match entry {
            Some(entry) => {
                Self::complete(entry, status, result);
                true
            }
            None => {
                debug!(task_id = %task_id, status = %status, "No pending task to resolve");
                false
            }
        }
    }

    /// Settle a task from a worker's result frame.
    ///
    /// Only `success` and `failed` are accepted, and only from the connection
    /// the task was sent to.
    pub fn resolve_from_worker(&self, handle: ConnectionHandle, data: Task) -> bool {
        if !matches!(data.status, TaskStatus::Success | TaskStatus::Failed) {
            warn!(
                handle = %handle,
                task_id = %data.task_id,
                status = %data.status,
                "Dropping result frame with non-final status"
            );
            return false;
        }

        let entry = {
            let mut pending = self.pending.lock();
            let owner = pending.get(&data.task_id).map(|e| e.handle);
            match owner {
                Some(owner) if owner != handle => {
                    warn!(
                        handle = %handle,
                        owner = %owner,
                        task_id = %data.task_id,
                        "Dropping result frame for a task owned by another connection"
                    );
                    return false;
                }
                Some(_) => pending.remove(&data.task_id),
                None => None,
            }
        };

        match entry {
            Some(entry) => {
                let result = data.result.unwrap_or(Value::Null);
                Self::complete(entry, data.status, result);
                true
            }
            None => {
                debug!(handle = %handle, task_id = %data.task_id, "Late or unknown task result ignored");
                false
            }
        }
    }

    /// Fail every task still pending on `handle`. Returns how many were failed.
    pub fn fail_all_for_connection(&self, handle: ConnectionHandle) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.handle == handle)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = entries.len();
        for entry in entries {
            Self::complete(entry, TaskStatus::Failed, json!(CONNECTION_CLOSED_RESULT));
        }
        if count > 0 {
            info!(handle = %handle, count, "Failed pending tasks for closed connection");
        }
        count
    }

    pub fn pending_count_for(&self, handle: ConnectionHandle) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|e| e.handle == handle)
            .count()
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.pending.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn complete(entry: PendingEntry, status: TaskStatus, result: Value) {
        entry.timer.abort();
        let task = entry.task.settle(status, result);
        debug!(
            handle = %entry.handle,
            task_id = %task.task_id,
            status = %task.status,
            "Task resolved"
        );
        // The dispatcher may have stopped listening; nothing to do then.
        let _ = entry.completion.send(task);
    }
}

impl Drop for TaskLedger {
    fn drop(&mut self) {
        for (_, entry) in self.pending.get_mut().drain() {
            entry.timer.abort();
        }
    }
}
