// ABOUTME: HTTP client for the in-sandbox runtime protocol (/init, /run, /health)
// ABOUTME: Classifies transport and status failures into the invoker's fault taxonomy

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("runtime rejected /init (status {status}): {body}")]
    InitClient { status: u16, body: String },

    #[error("runtime failed /init (status {status}): {body}")]
    InitRuntime { status: u16, body: String },

    #[error("/init did not complete within the allowed time")]
    InitTimeout,

    #[error("runtime rejected /run (status {status}): {body}")]
    RunClient { status: u16, body: String },

    #[error("action failed in runtime (status {status}): {body}")]
    RunRuntime { status: u16, body: String },

    #[error("the action did not produce a response within the allowed time")]
    RunTimeout,

    #[error("sandbox unreachable: {0}")]
    Unreachable(String),

    #[error("malformed runtime response: {0}")]
    MalformedResponse(String),

    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Code and metadata delivered to `/init`.
#[derive(Debug, Clone, Serialize)]
pub struct InitPayload {
    pub name: String,
    pub main: String,
    pub code: String,
    pub binary: bool,
    pub env: HashMap<String, String>,
}

/// Parameters and activation context delivered to `/run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunPayload {
    pub value: Map<String, Value>,
    pub namespace: String,
    pub action_name: String,
    pub activation_id: String,
    /// Absolute deadline, epoch milliseconds.
    pub deadline: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Run,
}

/// Stateless client for the runtime protocol. Safe for concurrent use on
/// distinct sandboxes; the pool's busy invariant prevents two concurrent
/// calls against the same sandbox.
pub struct RuntimeProxy {
    client: reqwest::Client,
    port: u16,
}

impl RuntimeProxy {
    pub fn new() -> Result<Self> {
        Self::with_port(8080)
    }

    /// Target a non-default runtime port. Tests use this to point the
    /// proxy at an in-process fake runtime.
    pub fn with_port(port: u16) -> Result<Self> {
        // No connection reuse: a dying sandbox must not poison a pooled
        // connection for the next call.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ProxyError::Client)?;

        Ok(Self { client, port })
    }

    /// Deliver action code to the sandbox. Success is a 200 with an
    /// `{"ok": true}` body; anything else is classified per status.
    pub async fn init(&self, addr: &str, payload: &InitPayload, timeout: Duration) -> Result<()> {
        let url = format!("http://{}:{}/init", addr, self.port);
        debug!(url = %url, action = %payload.name, binary = payload.binary, "initializing runtime");

        let body = serde_json::json!({ "value": payload });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(e, Phase::Init))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(e, Phase::Init))?;

        if status.is_success() {
            let ok = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("ok").and_then(Value::as_bool))
                .unwrap_or(false);
            if ok {
                return Ok(());
            }
            return Err(ProxyError::MalformedResponse(format!(
                "/init returned 200 without ok=true: {}",
                text
            )));
        }

        if status.is_client_error() {
            Err(ProxyError::InitClient {
                status: status.as_u16(),
                body: text,
            })
        } else {
            Err(ProxyError::InitRuntime {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    /// Execute the action. A 200 body is the action's result object.
    pub async fn run(
        &self,
        addr: &str,
        payload: &RunPayload,
        timeout: Duration,
    ) -> Result<Map<String, Value>> {
        let url = format!("http://{}:{}/run", addr, self.port);
        debug!(
            url = %url,
            activation_id = %payload.activation_id,
            deadline = payload.deadline,
            "running action"
        );

        let response = self
            .client
            .post(&url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(e, Phase::Run))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(e, Phase::Run))?;

        if status.is_success() {
            return match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => Ok(map),
                _ => Err(ProxyError::MalformedResponse(format!(
                    "/run returned 200 with a non-object body: {}",
                    text
                ))),
            };
        }

        if status.is_client_error() {
            Err(ProxyError::RunClient {
                status: status.as_u16(),
                body: text,
            })
        } else {
            Err(ProxyError::RunRuntime {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    /// Probe the runtime's readiness endpoint.
    pub async fn health(&self, addr: &str, timeout: Duration) -> Result<bool> {
        let url = format!("http://{}:{}/health", addr, self.port);

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(e, Phase::Run))?;

        if !response.status().is_success() {
            return Ok(false);
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(body.get("ok").and_then(Value::as_bool).unwrap_or(false)
            || body.get("status").and_then(Value::as_str) == Some("ready"))
    }
}

fn classify_transport(err: reqwest::Error, phase: Phase) -> ProxyError {
    // A connect failure (refused or connect-timeout) means the sandbox is
    // gone; only a timeout past the connect counts against the action.
    if err.is_connect() {
        return ProxyError::Unreachable(err.to_string());
    }
    if err.is_timeout() {
        return match phase {
            Phase::Init => ProxyError::InitTimeout,
            Phase::Run => ProxyError::RunTimeout,
        };
    }
    ProxyError::Unreachable(err.to_string())
}

/// Pull the `error` string out of a runtime failure body, falling back to
/// the raw body when it is not the conventional `{"error": "..."}` shape.
pub fn error_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_payload_wire_shape() {
        let payload = InitPayload {
            name: "hello".to_string(),
            main: "main".to_string(),
            code: "function main(p){return p}".to_string(),
            binary: false,
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
        };
        let wire = serde_json::json!({ "value": payload });

        let value = &wire["value"];
        assert_eq!(value["name"], "hello");
        assert_eq!(value["main"], "main");
        assert_eq!(value["binary"], false);
        assert_eq!(value["env"]["FOO"], "bar");
    }

    #[test]
    fn run_payload_wire_shape() {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::String("world".to_string()));
        let payload = RunPayload {
            value: params,
            namespace: "ns".to_string(),
            action_name: "hello".to_string(),
            activation_id: "abc".to_string(),
            deadline: 1717243200000,
        };

        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["value"]["name"], "world");
        assert_eq!(wire["namespace"], "ns");
        assert_eq!(wire["action_name"], "hello");
        assert_eq!(wire["activation_id"], "abc");
        assert_eq!(wire["deadline"], 1717243200000i64);
    }

    #[test]
    fn error_body_extracts_conventional_error_field() {
        assert_eq!(error_body(r#"{"error":"boom"}"#), "boom");
        assert_eq!(error_body(r#"{"error":{"code":7}}"#), r#"{"code":7}"#);
        assert_eq!(error_body("plain text failure"), "plain text failure");
    }
}
