// ABOUTME: Orchestrates one activation end-to-end: sandbox acquisition, init, run, logs, result
// ABOUTME: Every invocation-level fault is reified into an ActivationResult; nothing propagates upward

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use penguinwhisk_messaging::{
    ActivationResponse, ActivationResult, HandlerError, InvocationHandler, InvocationMessage,
    ResultPublisher, STATUS_APPLICATION_ERROR, STATUS_DEVELOPER_ERROR, STATUS_INTERNAL_ERROR,
    STATUS_SUCCESS,
};
use penguinwhisk_sandbox::proxy::error_body;
use penguinwhisk_sandbox::{
    InitPayload, LogCollector, PooledSandbox, ProxyError, RunPayload, RuntimeProxy, SandboxPool,
};

/// Blob-store fetches get their own budget, independent of the action's
/// invocation timeout.
const CODE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to build code-fetch client: {0}")]
    Client(reqwest::Error),
}

/// How a single `/init` + `/run` attempt ended, before classification.
enum Outcome {
    /// `/run` returned 200 with a JSON object. An `error` field inside it
    /// is an application error.
    Completed(Map<String, Value>),
    CodeFetchFailed(String),
    InitFailed(ProxyError),
    RunFailed(ProxyError),
}

/// Drives the full lifecycle of one activation across the pool, the
/// runtime proxy, and the log collector.
pub struct Executor {
    pool: Arc<SandboxPool>,
    proxy: Arc<RuntimeProxy>,
    logs: Arc<LogCollector>,
    code_client: reqwest::Client,
}

impl Executor {
    pub fn new(
        pool: Arc<SandboxPool>,
        proxy: Arc<RuntimeProxy>,
        logs: Arc<LogCollector>,
    ) -> Result<Self, ExecutorError> {
        let code_client = reqwest::Client::builder()
            .timeout(CODE_FETCH_TIMEOUT)
            .build()
            .map_err(ExecutorError::Client)?;

        Ok(Self {
            pool,
            proxy,
            logs,
            code_client,
        })
    }

    /// Execute one invocation and produce its activation record. Faults
    /// become results; this never fails.
    pub async fn execute(&self, msg: &InvocationMessage) -> ActivationResult {
        let start = Utc::now();
        let start_ms = start.timestamp_millis();

        if start_ms > msg.deadline {
            warn!(
                activation_id = %msg.activation_id,
                deadline = msg.deadline,
                "invocation deadline already exceeded"
            );
            return self.failure_result(msg, start_ms, "deadline already exceeded", false);
        }

        let action_id = msg.action.qualified_name();
        let (sandbox, cold) = match self.pool.acquire(&msg.action.exec.kind, &action_id).await {
            Ok(acquired) => acquired,
            Err(e) => {
                return self.failure_result(
                    msg,
                    start_ms,
                    format!("failed to acquire sandbox: {}", e),
                    false,
                )
            }
        };

        debug!(
            activation_id = %msg.activation_id,
            sandbox_id = %sandbox.sandbox.id,
            cold_start = cold,
            "sandbox acquired"
        );

        // The tighter of the message deadline and the action's own limit.
        let remaining = msg.deadline - Utc::now().timestamp_millis();
        let timeout_ms = if msg.action.limits.timeout > 0 {
            remaining.min(msg.action.limits.timeout)
        } else {
            remaining
        };
        let invocation_timeout = Duration::from_millis(timeout_ms.max(1) as u64);

        let outcome = self
            .drive(msg, &sandbox, cold, &action_id, invocation_timeout)
            .await;

        let log_budget = msg.action.limits.logs * 1024;
        let logs = match self
            .logs
            .collect(&sandbox.sandbox.id, start, log_budget)
            .await
        {
            Ok(lines) => lines,
            // Log collection failure is an annotation, not an error.
            Err(e) => vec![format!("Failed to collect activation logs: {}", e)],
        };

        let (status_code, response) = classify(outcome);
        let reuse = status_code == STATUS_SUCCESS || status_code == STATUS_APPLICATION_ERROR;

        if let Err(e) = self.pool.release(&sandbox.sandbox.id, reuse).await {
            warn!(
                sandbox_id = %sandbox.sandbox.id,
                error = %e,
                "failed to release sandbox"
            );
        }

        let end_ms = Utc::now().timestamp_millis();
        info!(
            activation_id = %msg.activation_id,
            status_code,
            duration_ms = end_ms - start_ms,
            cold_start = cold,
            reused = reuse,
            "activation complete"
        );

        ActivationResult {
            activation_id: msg.activation_id.clone(),
            namespace: msg.action.namespace.clone(),
            name: msg.action.name.clone(),
            version: msg.action.version.clone(),
            subject: subject(msg),
            start: start_ms,
            end: end_ms,
            duration: end_ms - start_ms,
            status_code,
            response,
            logs,
            annotations: annotations(msg, cold),
            cause: None,
        }
    }

    /// Init (on cold start) and run, reporting the first fault.
    async fn drive(
        &self,
        msg: &InvocationMessage,
        sandbox: &PooledSandbox,
        cold: bool,
        action_id: &str,
        timeout: Duration,
    ) -> Outcome {
        if cold {
            let code = match self.fetch_code(&msg.action.exec.code_url, msg.action.exec.binary).await
            {
                Ok(code) => code,
                Err(reason) => return Outcome::CodeFetchFailed(reason),
            };

            let init = InitPayload {
                name: msg.action.name.clone(),
                main: if msg.action.exec.main.is_empty() {
                    "main".to_string()
                } else {
                    msg.action.exec.main.clone()
                },
                code,
                binary: msg.action.exec.binary,
                env: sandbox_env(msg),
            };

            if let Err(e) = self.proxy.init(&sandbox.sandbox.addr, &init, timeout).await {
                return Outcome::InitFailed(e);
            }
            if let Err(e) = self.pool.mark_initialized(&sandbox.sandbox.id, action_id) {
                warn!(sandbox_id = %sandbox.sandbox.id, error = %e, "failed to record initialization");
            }
        }

        let run = RunPayload {
            value: msg.params.clone(),
            namespace: msg.action.namespace.clone(),
            action_name: msg.action.name.clone(),
            activation_id: msg.activation_id.clone(),
            deadline: msg.deadline,
        };

        match self.proxy.run(&sandbox.sandbox.addr, &run, timeout).await {
            Ok(result) => Outcome::Completed(result),
            Err(e) => Outcome::RunFailed(e),
        }
    }

    /// Retrieve action code from the blob store. Binary code is delivered
    /// base64-encoded, matching what runtimes expect in `/init`.
    async fn fetch_code(&self, code_url: &str, binary: bool) -> Result<String, String> {
        let response = self
            .code_client
            .get(code_url)
            .send()
            .await
            .map_err(|e| format!("failed to fetch action code: {}", e))?;

        if !response.status().is_success() {
            return Err(format!(
                "failed to fetch action code: blob store returned {}",
                response.status()
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("failed to read action code: {}", e))?;

        if binary {
            Ok(STANDARD.encode(&bytes))
        } else {
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    fn failure_result(
        &self,
        msg: &InvocationMessage,
        start_ms: i64,
        error: impl Into<String>,
        cold: bool,
    ) -> ActivationResult {
        let end_ms = Utc::now().timestamp_millis();
        ActivationResult {
            activation_id: msg.activation_id.clone(),
            namespace: msg.action.namespace.clone(),
            name: msg.action.name.clone(),
            version: msg.action.version.clone(),
            subject: subject(msg),
            start: start_ms,
            end: end_ms,
            duration: end_ms - start_ms,
            status_code: STATUS_INTERNAL_ERROR,
            response: ActivationResponse::failure(STATUS_INTERNAL_ERROR, error),
            logs: Vec::new(),
            annotations: annotations(msg, cold),
            cause: None,
        }
    }
}

/// Couples execution to result publication. The consumer acks a message
/// only after this handler returns, so the publish below is the point of
/// no return for at-least-once delivery.
pub struct ActivationHandler {
    executor: Arc<Executor>,
    publisher: Arc<ResultPublisher>,
}

impl ActivationHandler {
    pub fn new(executor: Arc<Executor>, publisher: Arc<ResultPublisher>) -> Self {
        Self {
            executor,
            publisher,
        }
    }
}

#[async_trait]
impl InvocationHandler for ActivationHandler {
    async fn handle(&self, msg: InvocationMessage) -> Result<(), HandlerError> {
        let result = self.executor.execute(&msg).await;

        // The consumer acks only after this publish succeeds, so a crash
        // here leaves the message pending for redelivery.
        self.publisher
            .publish(&result)
            .await
            .map_err(|e| Box::new(e) as HandlerError)?;

        if let Some(channel) = &msg.response_channel {
            if let Err(e) = self.publisher.publish_to_channel(channel, &result).await {
                // The canonical record exists; a blocked caller will time
                // out and find it on the activations stream.
                warn!(
                    activation_id = %result.activation_id,
                    channel = %channel,
                    error = %e,
                    "failed to publish blocking response"
                );
            }
        }

        Ok(())
    }
}

/// Map an outcome onto the response taxonomy. Only well-formed 200
/// responses (status 0 and 1) prove the in-sandbox proxy is still alive,
/// so only they permit reuse.
fn classify(outcome: Outcome) -> (i64, ActivationResponse) {
    match outcome {
        Outcome::Completed(result) => match result.get("error") {
            None => (STATUS_SUCCESS, ActivationResponse::success(result)),
            Some(err) => {
                let error = err
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                (
                    STATUS_APPLICATION_ERROR,
                    ActivationResponse {
                        status_code: STATUS_APPLICATION_ERROR,
                        success: false,
                        result: Some(result),
                        error: Some(error),
                    },
                )
            }
        },
        Outcome::CodeFetchFailed(reason) => (
            STATUS_INTERNAL_ERROR,
            ActivationResponse::failure(STATUS_INTERNAL_ERROR, reason),
        ),
        Outcome::InitFailed(e) => classify_proxy_fault(e),
        Outcome::RunFailed(e) => classify_proxy_fault(e),
    }
}

fn classify_proxy_fault(error: ProxyError) -> (i64, ActivationResponse) {
    match error {
        ProxyError::InitClient { ref body, .. }
        | ProxyError::InitRuntime { ref body, .. }
        | ProxyError::RunClient { ref body, .. }
        | ProxyError::RunRuntime { ref body, .. } => (
            STATUS_DEVELOPER_ERROR,
            ActivationResponse::failure(STATUS_DEVELOPER_ERROR, error_body(body)),
        ),
        ProxyError::MalformedResponse(_) => (
            STATUS_DEVELOPER_ERROR,
            ActivationResponse::failure(STATUS_DEVELOPER_ERROR, error.to_string()),
        ),
        ProxyError::RunTimeout => (
            STATUS_INTERNAL_ERROR,
            ActivationResponse::failure(
                STATUS_INTERNAL_ERROR,
                "The action did not produce a response within the allowed time.",
            ),
        ),
        ProxyError::InitTimeout | ProxyError::Unreachable(_) | ProxyError::Client(_) => (
            STATUS_INTERNAL_ERROR,
            ActivationResponse::failure(STATUS_INTERNAL_ERROR, error.to_string()),
        ),
    }
}

/// Environment injected into the sandbox ahead of `/init`.
fn sandbox_env(msg: &InvocationMessage) -> HashMap<String, String> {
    let mut env = HashMap::from([
        ("__OW_ACTIVATION_ID".to_string(), msg.activation_id.clone()),
        ("__OW_ACTION_NAME".to_string(), msg.action.name.clone()),
        ("__OW_NAMESPACE".to_string(), msg.action.namespace.clone()),
        ("__OW_API_KEY".to_string(), msg.context.api_key.clone()),
        ("__OW_API_HOST".to_string(), msg.context.api_host.clone()),
        (
            "__OW_ACTION_MEMORY".to_string(),
            msg.action.limits.memory.to_string(),
        ),
        (
            "__OW_ACTION_TIMEOUT".to_string(),
            msg.action.limits.timeout.to_string(),
        ),
        ("__OW_DEADLINE".to_string(), msg.deadline.to_string()),
    ]);
    for (k, v) in &msg.action.exec.env {
        env.insert(k.clone(), v.clone());
    }
    env
}

fn subject(msg: &InvocationMessage) -> String {
    if msg.context.namespace.is_empty() {
        msg.action.namespace.clone()
    } else {
        msg.context.namespace.clone()
    }
}

fn annotations(msg: &InvocationMessage, cold: bool) -> Map<String, Value> {
    let mut annotations = Map::new();
    annotations.insert("coldStart".to_string(), Value::Bool(cold));
    annotations.insert(
        "kind".to_string(),
        Value::String(msg.action.exec.kind.clone()),
    );
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(json: Value) -> Outcome {
        match json {
            Value::Object(map) => Outcome::Completed(map),
            _ => panic!("test outcome must be an object"),
        }
    }

    #[test]
    fn clean_result_is_success() {
        let (code, response) = classify(completed(serde_json::json!({"hello": "world"})));
        assert_eq!(code, STATUS_SUCCESS);
        assert!(response.success);
        assert_eq!(response.result.unwrap()["hello"], "world");
    }

    #[test]
    fn error_field_is_an_application_error_with_result_retained() {
        let (code, response) = classify(completed(serde_json::json!({"error": "nope"})));
        assert_eq!(code, STATUS_APPLICATION_ERROR);
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("nope"));
        assert_eq!(response.result.unwrap()["error"], "nope");
    }

    #[test]
    fn runtime_rejection_is_a_developer_error_with_surfaced_body() {
        let (code, response) = classify(Outcome::RunFailed(ProxyError::RunRuntime {
            status: 502,
            body: r#"{"error":"boom"}"#.to_string(),
        }));
        assert_eq!(code, STATUS_DEVELOPER_ERROR);
        assert_eq!(response.error.as_deref(), Some("boom"));
    }

    #[test]
    fn run_timeout_is_internal_with_canonical_message() {
        let (code, response) = classify(Outcome::RunFailed(ProxyError::RunTimeout));
        assert_eq!(code, STATUS_INTERNAL_ERROR);
        assert!(response.error.unwrap().contains("allowed time"));
    }

    #[test]
    fn unreachable_sandbox_is_internal() {
        let (code, _) = classify(Outcome::RunFailed(ProxyError::Unreachable(
            "connection refused".to_string(),
        )));
        assert_eq!(code, STATUS_INTERNAL_ERROR);
    }

    #[test]
    fn init_failures_destroy_classification() {
        let (code, _) = classify(Outcome::InitFailed(ProxyError::InitRuntime {
            status: 500,
            body: r#"{"error":"cannot compile"}"#.to_string(),
        }));
        assert_eq!(code, STATUS_DEVELOPER_ERROR);

        let (code, _) = classify(Outcome::InitFailed(ProxyError::InitTimeout));
        assert_eq!(code, STATUS_INTERNAL_ERROR);

        let (code, _) = classify(Outcome::CodeFetchFailed("404".to_string()));
        assert_eq!(code, STATUS_INTERNAL_ERROR);
    }

    #[test]
    fn malformed_init_response_is_a_developer_error() {
        // A 200 from /init whose body is not {"ok":true}.
        let (code, response) = classify(Outcome::InitFailed(ProxyError::MalformedResponse(
            "/init returned 200 without ok=true: <html>".to_string(),
        )));
        assert_eq!(code, STATUS_DEVELOPER_ERROR);
        assert!(!response.success);
    }

    #[test]
    fn sandbox_env_carries_platform_context() {
        let msg: InvocationMessage = serde_json::from_value(serde_json::json!({
            "activation_id": "act-9",
            "action": {
                "namespace": "guest",
                "name": "hello",
                "version": "0.0.1",
                "exec": {
                    "kind": "nodejs:20",
                    "env": { "MY_SETTING": "on" }
                },
                "limits": { "timeout": 3000, "memory": 128, "logs": 10 }
            },
            "deadline": 1717243210000i64,
            "context": { "namespace": "guest", "api_host": "http://controller:8080", "api_key": "k" }
        }))
        .unwrap();

        let env = sandbox_env(&msg);
        assert_eq!(env["__OW_ACTIVATION_ID"], "act-9");
        assert_eq!(env["__OW_ACTION_MEMORY"], "128");
        assert_eq!(env["__OW_ACTION_TIMEOUT"], "3000");
        assert_eq!(env["__OW_DEADLINE"], "1717243210000");
        assert_eq!(env["MY_SETTING"], "on");
    }
}
