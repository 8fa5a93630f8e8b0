// ABOUTME: Sandbox lifecycle crate for the PenguinWhisk invoker
// ABOUTME: Substrate abstraction with a Docker backend, warm pool, runtime protocol client, log collection

pub mod docker;
pub mod fake;
pub mod logs;
pub mod pool;
pub mod proxy;
pub mod substrate;

pub use docker::{DockerSubstrate, ResourceLimits};
pub use logs::{LogCollector, ACTIVATION_SENTINEL, DEFAULT_MAX_LOG_BYTES};
pub use pool::{PoolConfig, PoolError, PoolStats, PooledSandbox, SandboxPool};
pub use proxy::{InitPayload, ProxyError, RunPayload, RuntimeProxy};
pub use substrate::{Sandbox, SandboxSpec, SandboxState, Substrate, SubstrateError};
