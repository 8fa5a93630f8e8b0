// ABOUTME: Publishes activation results to the shared activations stream and blocking-response channels
// ABOUTME: Stream trimming caps memory; response channels keep one entry and expire on their own

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::{MessagingError, Result};
use crate::types::ActivationResult;

/// Stream every activation result is appended to.
pub const ACTIVATIONS_STREAM: &str = "penguinwhisk:activations";

const DEFAULT_MAX_STREAM_LEN: usize = 10_000;
const DEFAULT_CHANNEL_TTL: Duration = Duration::from_secs(300);

/// Writes activation results to Redis. One instance is shared by every
/// executor task; the connection manager is safe for concurrent use.
pub struct ResultPublisher {
    conn: ConnectionManager,
    stream: String,
    max_stream_len: usize,
    channel_ttl: Duration,
}

impl ResultPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            stream: ACTIVATIONS_STREAM.to_string(),
            max_stream_len: DEFAULT_MAX_STREAM_LEN,
            channel_ttl: DEFAULT_CHANNEL_TTL,
        }
    }

    /// Append the result to the activations stream, trimming approximately
    /// to the configured length.
    pub async fn publish(&self, result: &ActivationResult) -> Result<()> {
        let fields = result_fields(result)?;
        let mut conn = self.conn.clone();

        let _id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(self.max_stream_len),
                "*",
                &fields,
            )
            .await?;

        debug!(
            activation_id = %result.activation_id,
            status_code = result.status_code,
            "published activation result"
        );
        Ok(())
    }

    /// Mirror the result onto a blocking caller's response channel. The
    /// channel keeps only the latest entry and self-destructs after the
    /// TTL so abandoned channels do not accumulate.
    pub async fn publish_to_channel(&self, channel: &str, result: &ActivationResult) -> Result<()> {
        if channel.is_empty() {
            return Err(MessagingError::MissingField("response_channel"));
        }

        let fields = result_fields(result)?;
        let mut conn = self.conn.clone();

        let _id: String = conn
            .xadd_maxlen(channel, StreamMaxlen::Equals(1), "*", &fields)
            .await?;
        let _: bool = conn
            .expire(channel, self.channel_ttl.as_secs() as i64)
            .await?;

        debug!(
            activation_id = %result.activation_id,
            channel = %channel,
            "published blocking response"
        );
        Ok(())
    }
}

/// Flatten a result into the stream's field layout. Composite values
/// travel as JSON strings.
fn result_fields(result: &ActivationResult) -> Result<Vec<(String, String)>> {
    let mut fields = vec![
        ("activationId".to_string(), result.activation_id.clone()),
        ("namespace".to_string(), result.namespace.clone()),
        ("name".to_string(), result.name.clone()),
        ("version".to_string(), result.version.clone()),
        ("subject".to_string(), result.subject.clone()),
        ("start".to_string(), result.start.to_string()),
        ("end".to_string(), result.end.to_string()),
        ("duration".to_string(), result.duration.to_string()),
        ("statusCode".to_string(), result.status_code.to_string()),
        (
            "response".to_string(),
            serde_json::to_string(&result.response)?,
        ),
        ("logs".to_string(), serde_json::to_string(&result.logs)?),
        (
            "annotations".to_string(),
            serde_json::to_string(&result.annotations)?,
        ),
    ];

    if let Some(cause) = &result.cause {
        fields.push(("cause".to_string(), cause.clone()));
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivationResponse, STATUS_APPLICATION_ERROR};
    use serde_json::Map;

    fn sample_result() -> ActivationResult {
        ActivationResult {
            activation_id: "act-1".to_string(),
            namespace: "guest".to_string(),
            name: "hello".to_string(),
            version: "0.0.1".to_string(),
            subject: "guest".to_string(),
            start: 1000,
            end: 1500,
            duration: 500,
            status_code: STATUS_APPLICATION_ERROR,
            response: ActivationResponse::failure(STATUS_APPLICATION_ERROR, "nope"),
            logs: vec!["2024-06-01T12:00:00Z stdout: hi".to_string()],
            annotations: Map::new(),
            cause: None,
        }
    }

    #[test]
    fn fields_carry_the_stream_layout() {
        let fields = result_fields(&sample_result()).unwrap();
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();

        assert_eq!(
            keys,
            vec![
                "activationId",
                "namespace",
                "name",
                "version",
                "subject",
                "start",
                "end",
                "duration",
                "statusCode",
                "response",
                "logs",
                "annotations",
            ]
        );

        let response = &fields.iter().find(|(k, _)| k == "response").unwrap().1;
        let parsed: serde_json::Value = serde_json::from_str(response).unwrap();
        assert_eq!(parsed["error"], "nope");
        assert_eq!(parsed["success"], false);
    }

    #[test]
    fn cause_is_emitted_only_when_present() {
        let mut result = sample_result();
        assert!(!result_fields(&result)
            .unwrap()
            .iter()
            .any(|(k, _)| k == "cause"));

        result.cause = Some("parent-act".to_string());
        let fields = result_fields(&result).unwrap();
        assert!(fields.iter().any(|(k, v)| k == "cause" && v == "parent-act"));
    }
}
