// ABOUTME: Queue plumbing for the PenguinWhisk invoker
// ABOUTME: Invocation/activation wire types, consumer-group reader, result publisher, heartbeat

pub mod consumer;
pub mod error;
pub mod heartbeat;
pub mod publisher;
pub mod types;

pub use consumer::{
    HandlerError, InvocationHandler, QueueConsumer, CONSUMER_GROUP, INVOCATIONS_STREAM,
};
pub use error::{MessagingError, Result};
pub use heartbeat::{HeartbeatPublisher, HeartbeatSnapshot};
pub use publisher::{ResultPublisher, ACTIVATIONS_STREAM};
pub use types::{
    ActionSpec, ActivationResponse, ActivationResult, ExecSpec, InvocationContext,
    InvocationMessage, LimitsSpec, STATUS_APPLICATION_ERROR, STATUS_DEVELOPER_ERROR,
    STATUS_INTERNAL_ERROR, STATUS_SUCCESS,
};
