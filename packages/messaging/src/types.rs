// ABOUTME: Wire types for invocation messages and activation results
// ABOUTME: JSON layouts match the queue contracts consumed by the controller and schedulers

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Activation response status codes.
pub const STATUS_SUCCESS: i64 = 0;
pub const STATUS_APPLICATION_ERROR: i64 = 1;
pub const STATUS_DEVELOPER_ERROR: i64 = 2;
pub const STATUS_INTERNAL_ERROR: i64 = 3;

/// One invocation request, dequeued from the invocations stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMessage {
    pub activation_id: String,
    pub action: ActionSpec,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub blocking: bool,
    /// Stream to which a blocking caller's result is mirrored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel: Option<String>,
    /// Absolute deadline, epoch milliseconds.
    pub deadline: i64,
    #[serde(default)]
    pub context: InvocationContext,
}

/// The action to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub exec: ExecSpec,
    #[serde(default)]
    pub limits: LimitsSpec,
}

impl ActionSpec {
    /// Fully-qualified identifier used as the pool's initialized-action key.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}@{}", self.namespace, self.name, self.version)
    }
}

/// Execution metadata: runtime kind plus where to fetch the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSpec {
    pub kind: String,
    /// Blob-store reference for the action code, fetched on cold start.
    #[serde(default)]
    pub code_url: String,
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSpec {
    /// Per-invocation timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: i64,
    /// Memory limit in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory: i64,
    /// Log budget in kilobytes.
    #[serde(default)]
    pub logs: i64,
}

impl Default for LimitsSpec {
    fn default() -> Self {
        Self {
            timeout: default_timeout_ms(),
            memory: default_memory_mb(),
            logs: 0,
        }
    }
}

fn default_timeout_ms() -> i64 {
    60_000
}

fn default_memory_mb() -> i64 {
    256
}

/// Caller identity and platform endpoints forwarded into the sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationContext {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub api_host: String,
    #[serde(default)]
    pub api_key: String,
}

/// The outcome of one activation, published to the activations stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationResult {
    #[serde(rename = "activationId")]
    pub activation_id: String,
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub subject: String,
    /// Epoch milliseconds.
    pub start: i64,
    pub end: i64,
    pub duration: i64,
    #[serde(rename = "statusCode")]
    pub status_code: i64,
    pub response: ActivationResponse,
    pub logs: Vec<String>,
    pub annotations: Map<String, Value>,
    /// Parent activation for sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActivationResponse {
    pub fn success(result: Map<String, Value>) -> Self {
        Self {
            status_code: STATUS_SUCCESS,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(status_code: i64, error: impl Into<String>) -> Self {
        Self {
            status_code,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
