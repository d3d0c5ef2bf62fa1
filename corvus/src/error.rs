//! Client error taxonomy.
//!
//! Connection-level failures live here; protocol violations come from
//! `corvus-core`, key material failures from `nkeys`. JetStream has
//! its own taxonomy under [`crate::jetstream`]. All variants carry a
//! human description and are matchable; credentials and tokens never
//! appear in messages.

use std::time::Duration;

use thiserror::Error;

pub use corvus_core::ProtocolError;
pub use nkeys::creds::CredentialsError;
pub use nkeys::NKeyError;

/// Failures establishing or operating a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid url: {url}")]
    InvalidUrl { url: String },

    #[error("connection refused by {host}:{port}")]
    ConnectionRefused { host: String, port: u16 },

    #[error("dns resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    /// Server demands TLS; the client was configured to refuse it.
    #[error("server requires TLS")]
    TlsRequired,

    #[error("tls handshake failed: {reason}")]
    TlsHandshakeFailed { reason: String },

    #[error("tls configuration failed: {reason}")]
    TlsConfigurationFailed { reason: String },

    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("gave up after {attempts} reconnect attempts")]
    MaxReconnectsExceeded { attempts: u32 },

    #[error("server is shutting down")]
    ServerShuttingDown,

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("connection closed")]
    Closed,

    #[error("connection is draining")]
    Draining,

    #[error("not connected")]
    NotConnected,

    #[error("no servers available")]
    NoServersAvailable,

    #[error("i/o error: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io {
            reason: err.to_string(),
        }
    }
}

/// Top-level client error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    NKey(#[from] NKeyError),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}

impl Error {
    /// True when the connection is unusable and the error will repeat
    /// until a reconnect or a new client.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Connection(
                ConnectionError::Closed | ConnectionError::MaxReconnectsExceeded { .. }
            )
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::Timeout { .. }))
    }
}

impl From<corvus_core::CodecError> for Error {
    fn from(err: corvus_core::CodecError) -> Self {
        match err {
            corvus_core::CodecError::Io(e) => Error::Connection(e.into()),
            corvus_core::CodecError::Protocol(e) => Error::Protocol(e),
        }
    }
}

/// Shorthand result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
