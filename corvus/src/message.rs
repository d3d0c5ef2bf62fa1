//! The message type delivered to subscriptions and request callers.

use bytes::Bytes;
use corvus_core::HeaderMap;

/// An inbound message. Payload bytes are sliced straight out of the
/// read buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
}

impl Message {
    /// Status code from the header version line, when the server sent
    /// a synthetic status message (404/408/503).
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().and_then(HeaderMap::status)
    }

    pub fn description(&self) -> Option<&str> {
        self.headers.as_ref().and_then(HeaderMap::description)
    }
}
