//! Broker data model: task kinds, statuses, wire frames, and diagnostics types.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Result payload for a task whose timer fired.
pub const TIMEOUT_RESULT: &str = "Timeout";

/// Result payload for tasks failed because their connection went away.
pub const CONNECTION_CLOSED_RESULT: &str = "connection closed";

/// WebSocket `readyState` of a connection whose socket is open.
pub const READY_STATE_OPEN: u8 = 1;

/// WebSocket `readyState` of a connection that is being closed.
pub const READY_STATE_CLOSING: u8 = 2;

/// Opaque identifier for one accepted worker connection.
///
/// Drawn from a process-wide counter, so a handle is never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl ConnectionHandle {
    /// Allocate a fresh, never-before-seen handle.
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Kind of work a worker is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Read the node currently selected in the user's Figma tab.
    GetUserSelectedFigmaUiInfo,
}

impl Default for TaskType {
    fn default() -> Self {
        Self::GetUserSelectedFigmaUiInfo
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetUserSelectedFigmaUiInfo => write!(f, "get-user-selected-figma-ui-info"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get-user-selected-figma-ui-info" => Ok(Self::GetUserSelectedFigmaUiInfo),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// Lifecycle state of a task. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Success,
    Timeout,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    /// Counted as a failure in dispatch summaries.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Timeout | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One task sent to one worker. Doubles as the `data` payload of task frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_type: TaskType,
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Task {
    /// Create a pending task with a fresh time-ordered id.
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            task_id: Uuid::now_v7().to_string(),
            status: TaskStatus::Pending,
            result: None,
        }
    }

    /// Consume the pending task and produce its terminal form.
    pub fn settle(mut self, status: TaskStatus, result: Value) -> Self {
        self.status = status;
        self.result = Some(result);
        self
    }
}

/// A frame on the worker WebSocket, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    /// Keepalive. Either side may send it.
    Heartbeat,
    /// Task dispatch (server → worker) or task result (worker → server).
    Task { data: Task },
}

impl WsFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Diagnostic view of a single connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// 1-based position in the registry snapshot.
    pub index: usize,
    pub handle: ConnectionHandle,
    pub last_heartbeat_at: DateTime<Utc>,
    pub millis_since_heartbeat: u64,
    pub alive: bool,
    /// WebSocket `readyState` numbering: 1 open, 2 closing.
    pub ready_state: u8,
    pub pending_task_count: usize,
}

/// Diagnostic view of every live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsReport {
    pub total: usize,
    pub per_connection: Vec<ConnectionInfo>,
}

/// Aggregated outcome of a dispatch round, as returned over HTTP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub success: bool,
    pub task_type: TaskType,
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub results: Vec<Task>,
}

impl DispatchSummary {
    pub fn new(task_type: TaskType, results: Vec<Task>) -> Self {
        let success_count = results
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .count();
        let failed_count = results.iter().filter(|t| t.status.is_failure()).count();
        Self {
            success: true,
            task_type,
            total: results.len(),
            success_count,
            failed_count,
            results,
        }
    }
}
