//! Heartbeat supervisor: evicts silent connections and pings the rest.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ledger::TaskLedger;
use super::model::{ConnectionHandle, WsFrame};
use super::registry::ConnectionRegistry;

/// What one supervisor tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Connections removed for heartbeat silence.
    pub evicted: Vec<ConnectionHandle>,
    /// Connections a heartbeat frame was queued for.
    pub pinged: usize,
}

/// Periodic liveness check over the connection registry.
pub struct HeartbeatSupervisor {
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<TaskLedger>,
    interval: Duration,
    dead_after: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        ledger: Arc<TaskLedger>,
        interval: Duration,
        dead_after: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            interval,
            dead_after,
        }
    }

    /// Run one tick against the registry as of `now`.
    ///
    /// A connection silent for longer than `dead_after` is unregistered and its
    /// pending tasks failed; every other connection gets a heartbeat frame.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for connection in self.registry.snapshot() {
            let silence = connection.silence(now);
            if silence > self.dead_after {
                warn!(
                    handle = %connection.handle,
                    silent_ms = silence.as_millis() as u64,
                    "Evicting connection after missed heartbeats"
                );
                super::close_connection(&self.registry, &self.ledger, connection.handle);
                outcome.evicted.push(connection.handle);
                continue;
            }

            match connection.send(WsFrame::Heartbeat) {
                Ok(()) => outcome.pinged += 1,
                // Eviction catches it if the connection is really gone.
                Err(e) => debug!(handle = %connection.handle, error = %e, "Heartbeat not sent"),
            }
        }

        outcome
    }

    /// Tick every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Instant::now());
                    }
                    () = cancel.cancelled() => {
                        debug!("Heartbeat supervisor stopped");
                        break;
                    }
                }
            }
        })
    }
}
