//! Integration tests for the worker WebSocket + dispatch path.
//!
//! Each test starts the real broker on random ports, connects workers via
//! tokio-tungstenite, and exercises the wire contract end to end.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use task_broker::broker::model::{TaskStatus, TaskType};
use task_broker::config::BrokerConfig;
use task_broker::server::{RunningBroker, start_broker};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const TICK: Duration = Duration::from_millis(100);
const DEAD: Duration = Duration::from_millis(300);
const TASK_TIMEOUT: Duration = Duration::from_millis(1500);

const KIND: TaskType = TaskType::GetUserSelectedFigmaUiInfo;

/// How a test worker reacts to server frames.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    /// Answers heartbeats and replies `success` to every task.
    Reply,
    /// Answers heartbeats, never replies to tasks.
    Silent,
    /// Reads frames but never sends anything.
    Mute,
}

async fn start() -> RunningBroker {
    let config = BrokerConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ws_port: 0,
        http_port: 0,
        heartbeat_interval: TICK,
        heartbeat_timeout: DEAD,
        task_timeout: TASK_TIMEOUT,
        ..Default::default()
    };
    start_broker(config).await.expect("broker failed to start")
}

/// Connect a worker; returns once the broker has registered it.
async fn spawn_worker(running: &RunningBroker, behavior: Behavior) -> JoinHandle<Vec<Value>> {
    let before = running.broker().registry().len();
    let worker = spawn_worker_at(running.ws_addr(), behavior).await;
    wait_for_connections(running, before + 1).await;
    worker
}

/// Run a worker loop; the handle yields every JSON frame received before close.
async fn spawn_worker_at(addr: SocketAddr, behavior: Behavior) -> JoinHandle<Vec<Value>> {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("WS connect failed");

    tokio::spawn(async move {
        let (mut tx, mut rx) = ws.split();
        let mut seen = Vec::new();

        while let Some(Ok(msg)) = rx.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let frame: Value = serde_json::from_str(&text).expect("invalid JSON from server");
            seen.push(frame.clone());

            let reply = match (behavior, frame["type"].as_str()) {
                (Behavior::Mute, _) => None,
                (_, Some("heartbeat")) => Some(json!({"type": "heartbeat"})),
                (Behavior::Reply, Some("task")) => {
                    let mut data = frame["data"].clone();
                    data["status"] = json!("success");
                    data["result"] = json!({"node": "Frame 1"});
                    Some(json!({"type": "task", "data": data}))
                }
                _ => None,
            };
            if let Some(reply) = reply {
                if tx.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
        seen
    })
}

async fn wait_for_connections(running: &RunningBroker, n: usize) {
    while running.broker().registry().len() != n {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Connection lifecycle ─────────────────────────────────────────────

#[tokio::test]
async fn worker_receives_server_heartbeats() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let worker = spawn_worker(&running, Behavior::Reply).await;

        tokio::time::sleep(TICK * 5).await;
        assert_eq!(running.broker().registry().len(), 1);
        let report = running.broker().connections_snapshot();
        assert!(report.per_connection[0].alive);

        running.shutdown().await;
        let frames = worker.await.unwrap();
        assert!(frames.iter().any(|f| f["type"] == "heartbeat"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn heartbeating_worker_is_never_evicted() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let _worker = spawn_worker(&running, Behavior::Silent).await;

        // Many dead-threshold windows.
        tokio::time::sleep(DEAD * 6).await;
        assert_eq!(running.broker().registry().len(), 1);

        running.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mute_worker_is_evicted() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let worker = spawn_worker(&running, Behavior::Mute).await;

        wait_for_connections(&running, 0).await;

        // The broker closed the socket on its side.
        worker.await.unwrap();
        running.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Dispatch ─────────────────────────────────────────────────────────

#[tokio::test]
async fn dispatch_with_no_workers_returns_immediately() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let results = timeout(Duration::from_millis(100), running.broker().dispatch(KIND))
            .await
            .expect("dispatch blocked with no workers");
        assert!(results.is_empty());
        running.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dispatch_collects_worker_results() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let _a = spawn_worker(&running, Behavior::Reply).await;
        let _b = spawn_worker(&running, Behavior::Reply).await;

        let started = Instant::now();
        let results = running.broker().dispatch(KIND).await;

        assert!(started.elapsed() < TASK_TIMEOUT);
        assert_eq!(results.len(), 2);
        assert_ne!(results[0].task_id, results[1].task_id);
        for task in &results {
            assert_eq!(task.status, TaskStatus::Success);
            assert_eq!(task.result, Some(json!({"node": "Frame 1"})));
        }
        assert!(running.broker().ledger().is_empty());

        running.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mixed_outcomes_success_timeout_and_eviction() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let _a = spawn_worker(&running, Behavior::Reply).await;
        let _b = spawn_worker(&running, Behavior::Silent).await;
        let _c = spawn_worker(&running, Behavior::Mute).await;

        let started = Instant::now();
        let round = {
            let broker = running.broker().clone();
            tokio::spawn(async move { broker.dispatch(KIND).await })
        };

        // Well past eviction, well before the task timeout: only B is still pending.
        tokio::time::sleep(DEAD * 3).await;
        assert_eq!(running.broker().registry().len(), 2);
        assert_eq!(running.broker().ledger().len(), 1);
        assert!(!round.is_finished());

        let results = round.await.unwrap();
        assert!(started.elapsed() >= TASK_TIMEOUT);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, TaskStatus::Success);
        assert_eq!(results[1].status, TaskStatus::Timeout);
        assert_eq!(results[1].result, Some(json!("Timeout")));
        assert_eq!(results[2].status, TaskStatus::Failed);
        assert_eq!(results[2].result, Some(json!("connection closed")));

        running.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_disconnect_fails_its_task_immediately() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", running.ws_addr()))
            .await
            .unwrap();
        wait_for_connections(&running, 1).await;

        let round = {
            let broker = running.broker().clone();
            tokio::spawn(async move { broker.dispatch(KIND).await })
        };

        // Wait for the task frame, then hang up.
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == "task" {
                    assert_eq!(frame["data"]["status"], "pending");
                    assert_eq!(frame["data"]["taskType"], "get-user-selected-figma-ui-info");
                    break;
                }
            }
        }
        ws.close(None).await.unwrap();

        let results = timeout(TASK_TIMEOUT / 2, round)
            .await
            .expect("disconnect should fail the task before its timeout")
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Failed);

        running.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_ignored() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", running.ws_addr()))
            .await
            .unwrap();
        wait_for_connections(&running, 1).await;

        for junk in [
            "not json".to_string(),
            json!({"type": "mystery"}).to_string(),
            json!({"type": "task", "data": {"taskType": "get-user-selected-figma-ui-info", "taskId": "nope", "status": "success"}}).to_string(),
        ] {
            ws.send(Message::Text(junk.into())).await.unwrap();
        }
        ws.send(Message::Text(json!({"type": "heartbeat"}).to_string().into()))
            .await
            .unwrap();

        tokio::time::sleep(TICK).await;
        assert_eq!(running.broker().registry().len(), 1);

        running.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_fails_pending_tasks_and_closes_workers() {
    timeout(TEST_TIMEOUT, async {
        let running = start().await;
        let worker = spawn_worker(&running, Behavior::Silent).await;

        let round = {
            let broker = running.broker().clone();
            tokio::spawn(async move { broker.dispatch(KIND).await })
        };
        while running.broker().ledger().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        running.shutdown().await;

        let results = round.await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(results[0].result, Some(json!("connection closed")));

        let frames = worker.await.unwrap();
        assert!(frames.iter().any(|f| f["type"] == "task"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_connecting_during_shutdown_are_not_left_registered() {
    timeout(TEST_TIMEOUT, async {
        for _ in 0..5 {
            let running = start().await;
            let broker = running.broker().clone();
            let url = format!("ws://{}/ws", running.ws_addr());

            let clients: Vec<_> = (0..30)
                .map(|_| {
                    let url = url.clone();
                    tokio::spawn(async move { connect_async(url).await.ok() })
                })
                .collect();
            tokio::task::yield_now().await;

            running.shutdown().await;
            for client in clients {
                let _ = client.await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert!(broker.registry().is_empty());
            assert!(broker.ledger().is_empty());
        }
    })
    .await
    .expect("test timed out");
}

