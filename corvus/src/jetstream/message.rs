//! JetStream-delivered messages: ack-subject metadata and the
//! ACK/NAK/WPI/TERM signals.

use std::time::Duration;

use bytes::Bytes;
use corvus_core::HeaderMap;

use super::errors::{JetStreamError, JetStreamResult};
use crate::client::Client;
use crate::message::Message;

/// Metadata parsed positionally from a `$JS.ACK.` reply subject:
/// `$JS.ACK.<stream>.<consumer>.<num_delivered>.<stream_seq>.
/// <consumer_seq>.<timestamp_ns>.<num_pending>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMetadata {
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered (1 for first).
    pub num_delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    /// Nanoseconds since the Unix epoch at which the stream stored
    /// the message.
    pub timestamp_nanos: u64,
    /// Messages still pending for this consumer.
    pub num_pending: u64,
}

impl AckMetadata {
    /// Parse an ack subject. Requires at least 9 dot-tokens with the
    /// leading `$JS.ACK` literals.
    pub fn parse(subject: &str) -> JetStreamResult<Self> {
        let invalid = |reason: &str| JetStreamError::InvalidAck {
            reason: format!("{reason}: '{subject}'"),
        };
        let tokens: Vec<&str> = subject.split('.').collect();
        if tokens.len() < 9 {
            return Err(invalid("ack subject has too few tokens"));
        }
        if tokens[0] != "$JS" || tokens[1] != "ACK" {
            return Err(invalid("not an ack subject"));
        }
        let number = |index: usize, what: &str| -> JetStreamResult<u64> {
            tokens[index]
                .parse()
                .map_err(|_| invalid(&format!("non-numeric {what}")))
        };
        Ok(AckMetadata {
            stream: tokens[2].to_owned(),
            consumer: tokens[3].to_owned(),
            num_delivered: number(4, "delivery count")?,
            stream_sequence: number(5, "stream sequence")?,
            consumer_sequence: number(6, "consumer sequence")?,
            timestamp_nanos: number(7, "timestamp")?,
            num_pending: number(8, "pending count")?,
        })
    }

    /// Message timestamp as a [`Duration`] since the Unix epoch.
    pub fn timestamp(&self) -> Duration {
        Duration::from_nanos(self.timestamp_nanos)
    }
}

/// Acknowledgement signals a consumer can send for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; do not redeliver.
    Ack,
    /// Not processed; redeliver, optionally after a delay.
    Nak(Option<Duration>),
    /// Still working; extend the ack deadline.
    InProgress,
    /// Unprocessable; do not redeliver.
    Term,
}

impl AckKind {
    pub(crate) fn payload(&self) -> Bytes {
        match self {
            AckKind::Ack => Bytes::from_static(b"+ACK"),
            AckKind::Nak(None) => Bytes::from_static(b"-NAK"),
            AckKind::Nak(Some(delay)) => {
                Bytes::from(format!("-NAK {{\"delay\": {}}}", delay.as_nanos()))
            }
            AckKind::InProgress => Bytes::from_static(b"+WPI"),
            AckKind::Term => Bytes::from_static(b"+TERM"),
        }
    }
}

/// A message delivered through a JetStream consumer, with its parsed
/// metadata and ack controls.
#[derive(Debug)]
pub struct JetStreamMessage {
    message: Message,
    metadata: AckMetadata,
    client: Client,
}

impl JetStreamMessage {
    /// Wrap a plain message. Fails when the reply subject is missing
    /// or not a parseable ack subject; pull fetch skips such messages
    /// silently.
    pub(crate) fn try_parse(client: Client, message: Message) -> JetStreamResult<Self> {
        let reply = message.reply.as_deref().ok_or(JetStreamError::InvalidAck {
            reason: "No reply subject".into(),
        })?;
        let metadata = AckMetadata::parse(reply)?;
        Ok(Self {
            message,
            metadata,
            client,
        })
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.message.headers.as_ref()
    }

    pub fn metadata(&self) -> &AckMetadata {
        &self.metadata
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Positive acknowledgement (`+ACK`).
    pub async fn ack(&self) -> JetStreamResult<()> {
        self.send_ack(AckKind::Ack).await
    }

    /// Negative acknowledgement (`-NAK`), optionally delayed.
    pub async fn nak(&self, delay: Option<Duration>) -> JetStreamResult<()> {
        self.send_ack(AckKind::Nak(delay)).await
    }

    /// Extend the ack deadline (`+WPI`).
    pub async fn in_progress(&self) -> JetStreamResult<()> {
        self.send_ack(AckKind::InProgress).await
    }

    /// Terminate delivery of this message (`+TERM`).
    pub async fn term(&self) -> JetStreamResult<()> {
        self.send_ack(AckKind::Term).await
    }

    async fn send_ack(&self, kind: AckKind) -> JetStreamResult<()> {
        let reply = self
            .message
            .reply
            .as_deref()
            .ok_or(JetStreamError::InvalidAck {
                reason: "No reply subject".into(),
            })?;
        self.client
            .publish(reply, kind.payload())
            .await
            .map_err(|e| JetStreamError::AckFailed {
                reason: e.to_string(),
            })
    }
}
