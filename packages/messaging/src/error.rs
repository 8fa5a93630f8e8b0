// ABOUTME: Error type shared by the queue consumer, publisher, and heartbeat

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed invocation message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("message missing field {0}")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
