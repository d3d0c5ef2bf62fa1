//! JetStream error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors from the JetStream API layer, pull consumers, and message
/// acknowledgement.
#[derive(Debug, Error)]
pub enum JetStreamError {
    /// The request hit no responders: JetStream is not enabled for
    /// this server or account.
    #[error("jetstream is not enabled")]
    NotEnabled,

    #[error("stream not found: {name}")]
    StreamNotFound { name: String },

    #[error("consumer not found: {stream}/{consumer}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("message not found")]
    MessageNotFound,

    #[error("duplicate message")]
    DuplicateMessage,

    #[error("invalid ack: {reason}")]
    InvalidAck { reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Error object returned by the API.
    #[error("api error {code} ({err_code}): {description}")]
    Api {
        code: u16,
        err_code: u32,
        description: String,
    },

    #[error("invalid stream config: {reason}")]
    InvalidStreamConfig { reason: String },

    #[error("invalid consumer config: {reason}")]
    InvalidConsumerConfig { reason: String },

    #[error("stream name is required")]
    StreamNameRequired,

    #[error("consumer name is required")]
    ConsumerNameRequired,

    #[error("invalid stream name: '{name}'")]
    InvalidStreamName { name: String },

    #[error("invalid consumer name: '{name}'")]
    InvalidConsumerName { name: String },

    #[error("ack failed: {reason}")]
    AckFailed { reason: String },

    #[error("pull failed: {reason}")]
    PullFailed { reason: String },

    #[error("publish failed: {description}")]
    PublishFailed { description: String },

    /// The API answered with a body that does not decode.
    #[error("invalid api response: {reason}")]
    InvalidResponse { reason: String },

    /// Underlying client failure.
    #[error(transparent)]
    Client(#[from] crate::error::Error),
}

impl JetStreamError {
    /// Refine a generic API error for a stream-scoped operation.
    pub(crate) fn for_stream(self, name: &str) -> Self {
        match self {
            JetStreamError::Api {
                err_code: 10059, ..
            } => JetStreamError::StreamNotFound {
                name: name.to_owned(),
            },
            other => other,
        }
    }

    /// Refine a generic API error for a consumer-scoped operation.
    pub(crate) fn for_consumer(self, stream: &str, consumer: &str) -> Self {
        match self {
            JetStreamError::Api {
                err_code: 10014, ..
            } => JetStreamError::ConsumerNotFound {
                stream: stream.to_owned(),
                consumer: consumer.to_owned(),
            },
            other => other.for_stream(stream),
        }
    }

    /// Refine a generic API error for message lookups.
    pub(crate) fn for_message(self) -> Self {
        match self {
            JetStreamError::Api {
                err_code: 10037, ..
            } => JetStreamError::MessageNotFound,
            other => other,
        }
    }
}

pub type JetStreamResult<T> = std::result::Result<T, JetStreamError>;
