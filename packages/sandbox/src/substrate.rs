// ABOUTME: Substrate trait abstracting the container daemon behind sandbox lifecycle operations
// ABOUTME: Defines sandbox handle types and the error taxonomy for substrate failures

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("failed to create sandbox: {0}")]
    Create(String),

    #[error("failed to start sandbox {id}: {reason}")]
    Start { id: String, reason: String },

    #[error("sandbox {0} did not reach running state within {1:?}")]
    StartTimeout(String, Duration),

    #[error("failed to stop sandbox {id}: {reason}")]
    Stop { id: String, reason: String },

    #[error("failed to remove sandbox {id}: {reason}")]
    Remove { id: String, reason: String },

    #[error("failed to inspect sandbox {id}: {reason}")]
    Inspect { id: String, reason: String },

    #[error("failed to read sandbox output: {0}")]
    Logs(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("substrate unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Lifecycle state of a sandbox as reported by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Starting,
    Running,
    Stopped,
    Removed,
}

/// Handle to one isolated execution context.
///
/// Created and destroyed exclusively through a [`Substrate`]; never shared
/// between two concurrent invocations.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    /// Routable address on the invoker's private network. Empty until started.
    pub addr: String,
    pub state: SandboxState,
    pub runtime_kind: String,
    pub created_at: DateTime<Utc>,
}

/// Specification for creating a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    /// Memory limit in bytes; 0 means the substrate's configured default.
    pub memory_bytes: i64,
    /// Grace period the substrate allows on stop before force-killing.
    pub stop_timeout: Duration,
    pub env: HashMap<String, String>,
}

/// Operations the invoker needs from the sandboxing substrate.
///
/// The Docker-backed implementation is the only code that talks to the
/// container daemon; everything else (pool, executor, log collector) goes
/// through this trait, so tests can substitute an in-memory fake.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Create the invoker's private bridge network if it does not exist.
    async fn ensure_network(&self) -> Result<()>;

    /// Create an unstarted sandbox, pulling the image first if needed.
    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox>;

    /// Start a created sandbox and wait for it to be running.
    /// Returns the sandbox's address on the private network.
    async fn start(&self, id: &str) -> Result<String>;

    /// Request a graceful stop; the substrate force-kills after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Remove the sandbox and its volumes. Removing an already-removed
    /// sandbox is not an error.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Raw multiplexed output stream since `since` (8-byte frame headers,
    /// each payload prefixed with an RFC 3339 timestamp).
    async fn raw_logs(&self, id: &str, since: DateTime<Utc>) -> Result<Vec<u8>>;

    /// Enumerate sandboxes carrying this invoker's labels, plus any extra
    /// label filters. Includes stopped sandboxes; used for crash recovery.
    async fn list_sandboxes(&self, filters: &HashMap<String, String>) -> Result<Vec<Sandbox>>;
}
