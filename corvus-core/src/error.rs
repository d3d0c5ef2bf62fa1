//! Protocol-level error types.
//!
//! Typed variants so that callers can distinguish malformed frames,
//! subject violations, and server-reported conditions without string
//! matching. Connection-level failures live in the `corvus` crate.

use thiserror::Error;

/// Errors raised by the wire codec, subject validation, and header
/// parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A subject failed publish or subscribe validation.
    #[error("invalid subject: '{subject}'")]
    InvalidSubject { subject: String },

    /// A queue-group name is empty or contains whitespace.
    #[error("invalid queue group: '{name}'")]
    InvalidQueueGroup { name: String },

    /// A header block or header line could not be parsed.
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// Payload exceeds the advertised maximum.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The server stopped answering pings.
    #[error("stale connection")]
    StaleConnection,

    /// Server denied an operation on a subject.
    #[error("permission violation: {op} on '{subject}'")]
    PermissionViolation { op: String, subject: String },

    /// Server sent `-ERR`.
    #[error("server error: {message}")]
    ServerError { message: String },

    /// A frame could not be decoded.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// An inbound MSG referenced a SID we never issued.
    #[error("subscription not found: {sid}")]
    SubscriptionNotFound { sid: String },

    /// A request hit a subject with no active responders (status 503).
    #[error("no responders on '{subject}'")]
    NoResponders { subject: String },
}

impl ProtocolError {
    pub(crate) fn invalid_message(reason: impl Into<String>) -> Self {
        ProtocolError::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_header(reason: impl Into<String>) -> Self {
        ProtocolError::InvalidHeader {
            reason: reason.into(),
        }
    }

    /// True for conditions reported by the server rather than detected
    /// locally.
    pub fn is_server_reported(&self) -> bool {
        matches!(
            self,
            ProtocolError::ServerError { .. } | ProtocolError::PermissionViolation { .. }
        )
    }
}

/// Shorthand result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
