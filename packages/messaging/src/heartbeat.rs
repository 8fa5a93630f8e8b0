// ABOUTME: Periodic liveness publisher; schedulers route work to invokers with fresh heartbeats
// ABOUTME: Publishes invoker id, active count, and pool stats to a keyed entry with a TTL

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// What the invoker reports about itself on each beat.
#[derive(Debug, Clone)]
pub struct HeartbeatSnapshot {
    pub active_count: usize,
    pub pool_stats: serde_json::Value,
}

#[derive(Serialize)]
struct HeartbeatPayload<'a> {
    invoker_id: &'a str,
    /// Epoch milliseconds.
    timestamp: i64,
    active_count: usize,
    pool_stats: &'a serde_json::Value,
}

/// Publishes liveness pings until cancelled. The key expires after three
/// missed beats so a dead invoker disappears from scheduling on its own.
pub struct HeartbeatPublisher {
    conn: ConnectionManager,
    invoker_id: String,
    interval: Duration,
}

impl HeartbeatPublisher {
    pub fn new(conn: ConnectionManager, invoker_id: String, interval: Duration) -> Self {
        Self {
            conn,
            invoker_id,
            interval,
        }
    }

    pub fn key(&self) -> String {
        format!("penguinwhisk:invoker:{}:heartbeat", self.invoker_id)
    }

    /// Beat every interval, reading a fresh snapshot each time, until the
    /// token is cancelled. Publish failures are logged and retried on the
    /// next beat.
    pub async fn run<F>(&self, cancel: CancellationToken, mut snapshot: F) -> Result<()>
    where
        F: FnMut() -> HeartbeatSnapshot + Send,
    {
        let key = self.key();
        let ttl = (self.interval.as_secs() * 3).max(1);
        let mut tick = tokio::time::interval(self.interval);

        info!(invoker_id = %self.invoker_id, interval = ?self.interval, "heartbeat started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let snap = snapshot();
            let payload = HeartbeatPayload {
                invoker_id: &self.invoker_id,
                timestamp: chrono::Utc::now().timestamp_millis(),
                active_count: snap.active_count,
                pool_stats: &snap.pool_stats,
            };

            match serde_json::to_string(&payload) {
                Ok(body) => {
                    let mut conn = self.conn.clone();
                    let written: std::result::Result<(), redis::RedisError> =
                        conn.set_ex(&key, body, ttl).await;
                    match written {
                        Ok(()) => debug!(active = snap.active_count, "heartbeat published"),
                        Err(e) => warn!(error = %e, "failed to publish heartbeat"),
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize heartbeat"),
            }
        }

        info!(invoker_id = %self.invoker_id, "heartbeat stopped");
        Ok(())
    }
}
