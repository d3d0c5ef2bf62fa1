//! # corvus-core
//!
//! Protocol machinery for the corvus NATS client: the framed text
//! codec, subject validation and matching, the header multimap, the
//! connection lifecycle state machine, and the reconnect backoff
//! policy. Everything here is I/O-free; the `corvus` crate owns
//! sockets and tasks.

pub mod codec;
pub mod error;
pub mod headers;
pub mod info;
pub mod reconnect;
pub mod state;
pub mod subject;

pub use codec::{ClientOp, Codec, CodecError, ServerOp};
pub use error::{ProtocolError, ProtocolResult};
pub use headers::{
    HeaderMap, STATUS_NO_MESSAGES, STATUS_NO_RESPONDERS, STATUS_REQUEST_TIMEOUT,
};
pub use info::{ConnectInfo, ServerInfo};
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use state::{ConnectionEvent, ConnectionState, StateMachine, Transition};
pub use subject::{
    matches, new_inbox, validate_publish, validate_queue_group, validate_subscribe,
    DEFAULT_INBOX_PREFIX,
};
