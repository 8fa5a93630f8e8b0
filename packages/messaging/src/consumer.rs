// ABOUTME: Consumer-group reader for the invocations stream with at-least-once delivery
// ABOUTME: Spawns one bounded handler task per message; acks only after a result exists

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MessagingError, Result};
use crate::types::InvocationMessage;

/// Stream the controller enqueues invocations onto.
pub const INVOCATIONS_STREAM: &str = "penguinwhisk:invocations";
/// Consumer group shared by every invoker.
pub const CONSUMER_GROUP: &str = "invokers";

const READ_COUNT: usize = 10;
const BLOCK_TIMEOUT_MS: usize = 2_000;
/// Consecutive read failures tolerated before the consumer gives up and
/// lets the process exit for a supervisor restart.
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 5;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one invocation end-to-end, including result publication.
/// Returning `Err` means no result was published; the message is left
/// unacked so the group redelivers it.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn handle(&self, msg: InvocationMessage) -> std::result::Result<(), HandlerError>;
}

/// Reads the invocations stream as part of the `invokers` consumer group.
pub struct QueueConsumer {
    conn: ConnectionManager,
    consumer_name: String,
    handler: Arc<dyn InvocationHandler>,
    max_concurrent: usize,
    active: Arc<Mutex<usize>>,
}

impl QueueConsumer {
    /// Connect the consumer, creating the group (and stream) if absent.
    pub async fn new(
        conn: ConnectionManager,
        invoker_id: &str,
        handler: Arc<dyn InvocationHandler>,
        max_concurrent: usize,
    ) -> Result<Self> {
        ensure_group(conn.clone()).await?;

        let consumer_name = format!("invoker-{}", invoker_id);
        info!(
            stream = INVOCATIONS_STREAM,
            group = CONSUMER_GROUP,
            consumer = %consumer_name,
            "consumer initialized"
        );

        Ok(Self {
            conn,
            consumer_name,
            handler,
            max_concurrent: max_concurrent.max(1),
            active: Arc::new(Mutex::new(0)),
        })
    }

    /// Number of invocations currently being handled.
    pub fn active_count(&self) -> usize {
        *self.active.lock().unwrap()
    }

    /// Read-and-dispatch loop. Returns when `cancel` fires (after waiting
    /// up to `drain_deadline` for in-flight handlers) or when the queue
    /// connection fails persistently.
    pub async fn run(&self, cancel: CancellationToken, drain_deadline: Duration) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_failures = 0u32;

        info!(consumer = %self.consumer_name, "consumer started");

        loop {
            // Reap finished handlers so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}

            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.read_batch() => batch,
            };

            let entries = match batch {
                Ok(entries) => {
                    consecutive_failures = 0;
                    entries
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(error = %e, attempt = consecutive_failures, "failed to read invocation stream");
                    if consecutive_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for (message_id, values) in entries {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };

                let conn = self.conn.clone();
                let handler = self.handler.clone();
                let active = self.active.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    process_message(conn, handler, active, message_id, values).await;
                });
            }
        }

        info!(
            in_flight = tasks.len(),
            "consumer stopping; waiting for in-flight invocations"
        );

        let drained = tokio::time::timeout(drain_deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "drain deadline elapsed; abandoning in-flight invocations"
            );
            tasks.abort_all();
        }

        info!("consumer stopped");
        Ok(())
    }

    async fn read_batch(&self) -> Result<Vec<(String, HashMap<String, redis::Value>)>> {
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer_name)
            .count(READ_COUNT)
            .block(BLOCK_TIMEOUT_MS);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[INVOCATIONS_STREAM], &[">"], &options)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push((id.id, id.map));
            }
        }
        Ok(entries)
    }
}

async fn ensure_group(mut conn: ConnectionManager) -> Result<()> {
    let created: std::result::Result<(), redis::RedisError> = conn
        .xgroup_create_mkstream(INVOCATIONS_STREAM, CONSUMER_GROUP, "0")
        .await;

    match created {
        Ok(()) => {
            debug!(stream = INVOCATIONS_STREAM, group = CONSUMER_GROUP, "consumer group created");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => {
            debug!(stream = INVOCATIONS_STREAM, group = CONSUMER_GROUP, "consumer group exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn process_message(
    conn: ConnectionManager,
    handler: Arc<dyn InvocationHandler>,
    active: Arc<Mutex<usize>>,
    message_id: String,
    values: HashMap<String, redis::Value>,
) {
    let msg = match decode_message(&values) {
        Ok(msg) => msg,
        Err(e) => {
            // Poison pill: ack so it is not redelivered forever. The
            // scheduler detects the missing result by timeout.
            warn!(message_id = %message_id, error = %e, "dropping unparsable invocation message");
            ack(conn, &message_id).await;
            return;
        }
    };

    let activation_id = msg.activation_id.clone();
    debug!(message_id = %message_id, activation_id = %activation_id, "processing invocation");

    *active.lock().unwrap() += 1;
    let outcome = handler.handle(msg).await;
    *active.lock().unwrap() -= 1;

    match outcome {
        Ok(()) => ack(conn, &message_id).await,
        Err(e) => {
            // No result was published; leave the message pending so the
            // group redelivers it to another invoker.
            error!(
                message_id = %message_id,
                activation_id = %activation_id,
                error = %e,
                "invocation handler failed; message left for redelivery"
            );
        }
    }
}

/// Extract and parse the JSON envelope from a stream entry's `data` field.
pub fn decode_message(values: &HashMap<String, redis::Value>) -> Result<InvocationMessage> {
    let raw = values
        .get("data")
        .ok_or(MessagingError::MissingField("data"))?;
    let data: String = redis::from_redis_value(raw)?;
    Ok(serde_json::from_str(&data)?)
}

async fn ack(mut conn: ConnectionManager, message_id: &str) {
    let acked: std::result::Result<i64, redis::RedisError> = conn
        .xack(INVOCATIONS_STREAM, CONSUMER_GROUP, &[message_id])
        .await;
    if let Err(e) = acked {
        error!(message_id = %message_id, error = %e, "failed to acknowledge message");
    }
}
