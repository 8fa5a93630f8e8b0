// ABOUTME: Library surface of the invoker binary, split out so integration tests can drive it

pub mod config;
pub mod executor;
pub mod recovery;

pub use config::{Config, ConfigError};
pub use executor::{ActivationHandler, Executor, ExecutorError};
pub use recovery::remove_leftover_sandboxes;
