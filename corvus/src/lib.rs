//! # corvus
//!
//! An async NATS client: core publish/subscribe and request/reply over
//! a reconnect-capable connection, plus a JetStream layer for
//! acknowledged publishes, pull consumers, and stream administration.
//!
//! ```no_run
//! use corvus::{Client, ClientOptions};
//!
//! # async fn example() -> corvus::Result<()> {
//! let client = Client::connect(ClientOptions::default().with_server("nats://localhost:4222")?)
//!     .await?;
//!
//! let mut sub = client.subscribe("greet.*").await?;
//! client.publish("greet.world", "hello").await?;
//! let msg = sub.next().await.expect("a message");
//! assert_eq!(&msg.payload[..], b"hello");
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
pub mod jetstream;
mod message;
mod multiplexer;
mod options;
mod request;
mod subscription;
mod tls;

pub use client::{Client, Statistics};
pub use error::{ConnectionError, CredentialsError, Error, NKeyError, ProtocolError, Result};
pub use message::Message;
pub use options::{Auth, ClientOptions, ServerAddr, TlsOptions, DEFAULT_PORT};
pub use subscription::Subscription;

// protocol types users routinely touch
pub use corvus_core::{
    ConnectionState, HeaderMap, ReconnectPolicy, ServerInfo, STATUS_NO_MESSAGES,
    STATUS_NO_RESPONDERS, STATUS_REQUEST_TIMEOUT,
};
