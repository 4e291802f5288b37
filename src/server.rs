//! Server startup and graceful shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::api_routes;
use crate::broker::Broker;
use crate::broker::ws::worker_routes;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

/// A started broker: worker socket listener, HTTP API listener and heartbeat supervisor.
pub struct RunningBroker {
    broker: Broker,
    ws_addr: SocketAddr,
    http_addr: SocketAddr,
    supervisor_cancel: CancellationToken,
    server_cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Bind both listeners and start accepting worker connections.
pub async fn start_broker(config: BrokerConfig) -> Result<RunningBroker> {
    config.validate()?;

    let ws_listener = bind(config.ws_addr()).await?;
    let http_listener = bind(config.http_addr()).await?;
    let ws_addr = ws_listener.local_addr()?;
    let http_addr = http_listener.local_addr()?;

    let ws_path = config.ws_path.clone();
    let broker = Broker::new(config);

    let supervisor_cancel = CancellationToken::new();
    let server_cancel = CancellationToken::new();

    let handles = vec![
        broker.spawn_heartbeat_supervisor(supervisor_cancel.clone()),
        serve(
            "worker",
            ws_listener,
            worker_routes(broker.clone(), &ws_path),
            server_cancel.clone(),
        ),
        serve(
            "api",
            http_listener,
            api_routes(broker.clone()),
            server_cancel.clone(),
        ),
    ];

    info!(addr = %ws_addr, path = %ws_path, "Worker WebSocket server started");
    info!(addr = %http_addr, "HTTP API server started");

    Ok(RunningBroker {
        broker,
        ws_addr,
        http_addr,
        supervisor_cancel,
        server_cancel,
        handles,
    })
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| BrokerError::Bind { addr, source }.into())
}

fn serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;
        if let Err(e) = result {
            error!(server = name, error = %BrokerError::Serve(e), "Server exited with error");
        }
    })
}

impl RunningBroker {
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Address the worker socket is listening on.
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Address the HTTP API is listening on.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Stop heartbeats, close every worker connection, then release the listeners.
    pub async fn shutdown(self) {
        let timeout: Duration = self.broker.config().shutdown_timeout;

        self.supervisor_cancel.cancel();
        let closed = self.broker.close_all();
        self.server_cancel.cancel();

        info!(
            connections = closed,
            task_count = self.handles.len(),
            timeout_secs = timeout.as_secs(),
            "Waiting for broker tasks to complete"
        );

        let drain = futures::future::join_all(self.handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("Shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}
