//! HTTP endpoints for the tool layer: health, connection status, and dispatch.

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::broker::Broker;
use crate::broker::model::{DispatchSummary, TaskType};

/// Build the Axum router with the status and dispatch routes.
///
/// `/test-task` is kept as an alias of `POST /dispatch` for existing clients.
pub fn api_routes(broker: Broker) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ws-status", get(ws_status))
        .route("/dispatch", get(dispatch_query).post(dispatch_body))
        .route("/test-task", post(dispatch_body))
        .layer(CorsLayer::permissive())
        .with_state(broker)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchRequest {
    task_type: Option<String>,
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "task-broker"
    }))
}

// ── Index ───────────────────────────────────────────────────────────────

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>task-broker</title></head>
<body>
<h1>task-broker</h1>
<p>Worker connections: <span id="total">-</span></p>
<pre id="status"></pre>
<button id="send">Send test task</button>
<pre id="result"></pre>
<script>
async function refresh() {
  const res = await fetch('/ws-status');
  const report = await res.json();
  document.getElementById('total').textContent = report.total;
  document.getElementById('status').textContent = JSON.stringify(report.perConnection, null, 2);
}
document.getElementById('send').onclick = async () => {
  const res = await fetch('/test-task', {
    method: 'POST',
    headers: {'Content-Type': 'application/json'},
    body: '{}'
  });
  document.getElementById('result').textContent = JSON.stringify(await res.json(), null, 2);
};
refresh();
setInterval(refresh, 2000);
</script>
</body>
</html>
"#;

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// ── Status ──────────────────────────────────────────────────────────────

async fn ws_status(State(broker): State<Broker>) -> impl IntoResponse {
    Json(broker.connections_snapshot())
}

// ── Dispatch ────────────────────────────────────────────────────────────

async fn dispatch_query(
    State(broker): State<Broker>,
    Query(req): Query<DispatchRequest>,
) -> Response {
    run_dispatch(&broker, req.task_type).await
}

async fn dispatch_body(
    State(broker): State<Broker>,
    body: Result<Option<Json<DispatchRequest>>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Some(Json(req))) => req,
        // No JSON content type: nothing to read, use the default task type.
        Ok(None) => DispatchRequest::default(),
        Err(e) => return bad_request(format!("Invalid request body: {}", e.body_text())),
    };
    run_dispatch(&broker, req.task_type).await
}

async fn run_dispatch(broker: &Broker, task_type: Option<String>) -> Response {
    let task_type = match task_type.as_deref().map(str::parse::<TaskType>).transpose() {
        Ok(t) => t.unwrap_or_default(),
        Err(e) => return bad_request(e),
    };

    let results = broker.dispatch(task_type).await;
    Json(DispatchSummary::new(task_type, results)).into_response()
}

fn bad_request(error: String) -> Response {
    warn!(error = %error, "Rejected dispatch request");
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "error": error })),
    )
        .into_response()
}
