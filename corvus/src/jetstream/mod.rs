//! JetStream: typed JSON request/response over NATS subjects, stream
//! and consumer administration, pull delivery with acks.

use std::time::Duration;

use bytes::Bytes;
use corvus_core::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::client::Client;
use crate::error::{ConnectionError, Error, ProtocolError};

pub mod consumer;
pub mod errors;
pub mod message;
pub mod stream;

pub use consumer::{
    AckPolicy, Consumer, ConsumerConfig, ConsumerInfo, DeliverPolicy, ReplayPolicy, SequenceInfo,
};
pub use errors::{JetStreamError, JetStreamResult};
pub use message::{AckKind, AckMetadata, JetStreamMessage};
pub use stream::{
    AccountInfo, AccountLimits, DiscardPolicy, RetentionPolicy, StorageType, StoredMessage,
    StreamConfig, StreamInfo, StreamState,
};

/// Default API subject prefix.
pub const DEFAULT_API_PREFIX: &str = "$JS.API";

/// Default deadline for JetStream API requests.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

/// Error object carried in API response bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: u32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

/// Headers attached to an acknowledged publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Deduplication id (`Nats-Msg-Id`).
    pub msg_id: Option<String>,
    /// Require the subject to belong to this stream.
    pub expected_stream: Option<String>,
    pub expected_last_msg_id: Option<String>,
    pub expected_last_sequence: Option<u64>,
    pub expected_last_subject_sequence: Option<u64>,
}

impl PublishOptions {
    fn to_headers(&self) -> Option<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(ref id) = self.msg_id {
            headers.insert("Nats-Msg-Id", id.clone());
        }
        if let Some(ref stream) = self.expected_stream {
            headers.insert("Nats-Expected-Stream", stream.clone());
        }
        if let Some(ref id) = self.expected_last_msg_id {
            headers.insert("Nats-Expected-Last-Msg-Id", id.clone());
        }
        if let Some(seq) = self.expected_last_sequence {
            headers.insert("Nats-Expected-Last-Sequence", seq.to_string());
        }
        if let Some(seq) = self.expected_last_subject_sequence {
            headers.insert("Nats-Expected-Last-Subject-Sequence", seq.to_string());
        }
        (!headers.is_empty()).then_some(headers)
    }
}

/// Acknowledgement of a JetStream publish.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub domain: Option<String>,
}

impl PubAck {
    /// The server deduplicated this publish against an earlier
    /// `Nats-Msg-Id`.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }
}

/// JetStream entry point, created from a connected [`Client`].
#[derive(Clone)]
pub struct Context {
    client: Client,
    prefix: String,
    timeout: Duration,
}

impl Context {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            prefix: DEFAULT_API_PREFIX.to_owned(),
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    /// Use a custom API prefix (cross-account import or domain).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Use a custom deadline for API requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn api_subject(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.prefix)
    }

    /// One typed API round trip: request on `<prefix>.<suffix>`, then
    /// inspect for 503 (not enabled), an `error` body, or the expected
    /// type.
    pub(crate) async fn request_api<T: DeserializeOwned>(
        &self,
        suffix: &str,
        payload: Vec<u8>,
    ) -> JetStreamResult<T> {
        let subject = self.api_subject(suffix);
        debug!(%subject, "jetstream api request");
        let response = self
            .client
            .request_with_timeout(&subject, Bytes::from(payload), self.timeout)
            .await;
        let message = match response {
            Ok(message) => message,
            Err(Error::Protocol(ProtocolError::NoResponders { .. })) => {
                return Err(JetStreamError::NotEnabled)
            }
            Err(Error::Connection(ConnectionError::Timeout { after })) => {
                return Err(JetStreamError::Timeout {
                    operation: suffix.to_owned(),
                    after,
                })
            }
            Err(e) => return Err(e.into()),
        };
        parse_api_response(&message.payload)
    }

    /// Publish with acknowledgement. The message flows through the
    /// stream matching `subject`; the returned [`PubAck`] carries the
    /// assigned sequence.
    pub async fn publish(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> JetStreamResult<PubAck> {
        self.publish_with_options(subject, &PublishOptions::default(), payload)
            .await
    }

    /// Publish with dedup / expectation headers attached.
    pub async fn publish_with_options(
        &self,
        subject: &str,
        options: &PublishOptions,
        payload: impl Into<Bytes>,
    ) -> JetStreamResult<PubAck> {
        let headers = options.to_headers();
        let response = match headers {
            Some(headers) => {
                self.client
                    .request_full(subject, Some(headers), payload.into(), self.timeout)
                    .await
            }
            None => {
                self.client
                    .request_with_timeout(subject, payload.into(), self.timeout)
                    .await
            }
        };
        let message = match response {
            Ok(message) => message,
            Err(Error::Protocol(ProtocolError::NoResponders { .. })) => {
                return Err(JetStreamError::PublishFailed {
                    description: format!("no stream is listening on '{subject}'"),
                })
            }
            Err(Error::Connection(ConnectionError::Timeout { after })) => {
                return Err(JetStreamError::Timeout {
                    operation: format!("publish to '{subject}'"),
                    after,
                })
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(status) = message.status() {
            if status >= 400 {
                return Err(JetStreamError::PublishFailed {
                    description: message
                        .description()
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("status {status}")),
                });
            }
        }
        parse_api_response(&message.payload)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Decode an API body: an `error` envelope wins, otherwise the
/// expected type.
pub(crate) fn parse_api_response<T: DeserializeOwned>(payload: &[u8]) -> JetStreamResult<T> {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(payload) {
        return Err(JetStreamError::Api {
            code: envelope.error.code,
            err_code: envelope.error.err_code,
            description: envelope.error.description,
        });
    }
    serde_json::from_slice(payload).map_err(|e| JetStreamError::InvalidResponse {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_wins() {
        let body = br#"{"type":"io.nats.jetstream.api.v1.stream_info_response",
            "error":{"code":404,"err_code":10059,"description":"stream not found"}}"#;
        let parsed: JetStreamResult<PubAck> = parse_api_response(body);
        match parsed {
            Err(JetStreamError::Api {
                code,
                err_code,
                description,
            }) => {
                assert_eq!(code, 404);
                assert_eq!(err_code, 10059);
                assert_eq!(description, "stream not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pub_ack_decodes() {
        let parsed: PubAck =
            parse_api_response(br#"{"stream":"S","seq":3,"duplicate":true}"#).unwrap();
        assert_eq!(parsed.stream, "S");
        assert_eq!(parsed.seq, 3);
        assert!(parsed.is_duplicate());
        assert!(parsed.domain.is_none());
    }

    #[test]
    fn garbage_is_invalid_response() {
        let parsed: JetStreamResult<PubAck> = parse_api_response(b"not json");
        assert!(matches!(parsed, Err(JetStreamError::InvalidResponse { .. })));
    }

    #[test]
    fn publish_options_headers() {
        let options = PublishOptions {
            msg_id: Some("id-1".into()),
            expected_stream: Some("S".into()),
            expected_last_sequence: Some(41),
            ..Default::default()
        };
        let headers = options.to_headers().unwrap();
        assert_eq!(headers.get("Nats-Msg-Id"), Some("id-1"));
        assert_eq!(headers.get("Nats-Expected-Stream"), Some("S"));
        assert_eq!(headers.get("Nats-Expected-Last-Sequence"), Some("41"));
        assert_eq!(headers.get("Nats-Expected-Last-Msg-Id"), None);

        assert!(PublishOptions::default().to_headers().is_none());
    }
}
