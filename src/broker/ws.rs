//! WebSocket endpoint that workers connect to.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tracing::{debug, info, warn};

use super::Broker;
use super::model::{ConnectionHandle, WsFrame};
use super::registry::WorkerTransport;

/// Build the Axum router serving the worker socket at `path`.
pub fn worker_routes(broker: Broker, path: &str) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .with_state(broker)
}

async fn ws_handler(ws: WebSocketUpgrade, State(broker): State<Broker>) -> impl IntoResponse {
    debug!("Worker WebSocket connecting");
    ws.on_upgrade(|socket| handle_socket(socket, broker))
}

async fn handle_socket(mut socket: WebSocket, broker: Broker) {
    let (transport, mut outbound, close) = WorkerTransport::channel(broker.config().outbound_buffer);
    let handle = match broker.accept(transport) {
        Ok(handle) => handle,
        Err(e) => {
            info!(error = %e, "Rejecting worker connection");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            // Frames queued by dispatch and the heartbeat supervisor
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match frame.to_json() {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!(handle = %handle, "Worker disconnected during send");
                            break;
                        }
                    }
                    Err(e) => warn!(handle = %handle, error = %e, "Failed to encode frame"),
                }
            }

            // Unregistered by the broker (eviction or shutdown)
            () = close.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }

            // Frames from the worker
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_worker_message(&text, handle, &broker);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(handle = %handle, "Worker disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(handle = %handle, error = %e, "Worker WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    broker.close_connection(handle);
    info!(handle = %handle, "Worker WebSocket connection closed");
}

/// Parse and apply one text frame. Malformed frames are logged and dropped.
fn handle_worker_message(text: &str, handle: ConnectionHandle, broker: &Broker) {
    match serde_json::from_str::<WsFrame>(text) {
        Ok(frame) => broker.handle_frame(handle, frame),
        Err(e) => {
            warn!(handle = %handle, error = %e, text = text, "Dropping malformed worker frame");
        }
    }
}
