use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use task_broker::config::BrokerConfig;
use task_broker::server::start_broker;

/// Fan tasks out to connected worker agents and collect their results.
#[derive(Debug, Parser)]
#[command(name = "task-broker", version)]
struct Cli {
    /// Address both listeners bind to.
    #[arg(long, env = "TASK_BROKER_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port for the HTTP status/dispatch API.
    #[arg(short = 'm', long, env = "TASK_BROKER_HTTP_PORT", default_value_t = 3100)]
    http_port: u16,

    /// Port for the worker WebSocket.
    #[arg(short = 'w', long, env = "TASK_BROKER_WS_PORT", default_value_t = 3101)]
    ws_port: u16,

    /// Route the worker WebSocket is served on.
    #[arg(long, env = "TASK_BROKER_WS_PATH", default_value = "/ws")]
    ws_path: String,

    /// Heartbeat supervisor tick in milliseconds.
    #[arg(long, env = "TASK_BROKER_HEARTBEAT_MS", default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Heartbeat silence in milliseconds after which a worker is evicted.
    #[arg(long, env = "TASK_BROKER_DEAD_MS", default_value_t = 3000)]
    dead_ms: u64,

    /// Per-task timeout in milliseconds.
    #[arg(long, env = "TASK_BROKER_TASK_TIMEOUT_MS", default_value_t = 180_000)]
    task_timeout_ms: u64,

    /// Outbound frame queue capacity per worker.
    #[arg(long, env = "TASK_BROKER_OUTBOUND_BUFFER", default_value_t = 64)]
    outbound_buffer: usize,
}

impl Cli {
    fn into_config(self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.bind,
            ws_port: self.ws_port,
            ws_path: self.ws_path,
            http_port: self.http_port,
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            heartbeat_timeout: Duration::from_millis(self.dead_ms),
            task_timeout: Duration::from_millis(self.task_timeout_ms),
            outbound_buffer: self.outbound_buffer,
            ..BrokerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Cli::parse().into_config();

    eprintln!("Task broker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker WS: ws://{}:{}{}", config.bind_addr, config.ws_port, config.ws_path);
    eprintln!("   Status:    http://{}:{}/ws-status", config.bind_addr, config.http_port);
    eprintln!("   Dispatch:  http://{}:{}/dispatch", config.bind_addr, config.http_port);

    let running = start_broker(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    running.shutdown().await;

    Ok(())
}
