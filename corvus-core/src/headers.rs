//! Message headers: an ordered, case-insensitive multimap.
//!
//! The wire form is the `NATS/1.0` header block used by HPUB/HMSG.
//! Insertion order and duplicate names survive a wire round-trip.
//! Converting to a plain map (`to_map`) collapses duplicates and is
//! lossy; it exists only for display and JSON embedding.

use std::fmt;

use crate::error::{ProtocolError, ProtocolResult};

/// Leading token of every header block.
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Status carried on synthetic server messages: no messages available.
pub const STATUS_NO_MESSAGES: u16 = 404;
/// Status carried on synthetic server messages: request expired.
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Status carried on synthetic server messages: no responders.
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Ordered header multimap with optional status line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
    status: Option<u16>,
    description: Option<String>,
}

impl HeaderMap {
    /// Empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a name/value pair, keeping any existing pairs with the
    /// same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all pairs with this name by a single pair.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// First value for a name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    /// Status code from the version line, if the server attached one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Free-text remainder of the status line.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Lossy map view: later duplicates overwrite earlier ones.
    pub fn to_map(&self) -> std::collections::BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }

    /// Serialize to the wire header block, trailing blank line included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.entries.len() * 24);
        out.extend_from_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = self.status {
            out.extend_from_slice(format!(" {status}").as_bytes());
            if let Some(ref desc) = self.description {
                out.extend_from_slice(b" ");
                out.extend_from_slice(desc.as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Parse a wire header block (version line through trailing blank
    /// line).
    pub fn decode(block: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| ProtocolError::invalid_header("header block is not UTF-8"))?;
        let mut lines = text.split("\r\n");

        let version = lines
            .next()
            .ok_or_else(|| ProtocolError::invalid_header("empty header block"))?;
        let rest = version
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| ProtocolError::invalid_header("missing NATS/1.0 version line"))?;

        let mut headers = HeaderMap::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (status, description) = match rest.split_once(' ') {
                Some((code, desc)) => (code, Some(desc.trim())),
                None => (rest, None),
            };
            let status: u16 = status
                .parse()
                .map_err(|_| ProtocolError::invalid_header(format!("bad status: '{status}'")))?;
            headers.status = Some(status);
            headers.description = description.filter(|d| !d.is_empty()).map(str::to_owned);
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(ProtocolError::invalid_header(format!(
                    "header line without ':': '{line}'"
                )));
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            headers.entries.push((name.to_owned(), value.trim().to_owned()));
        }
        Ok(headers)
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "[{status}] ")?;
        }
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = HeaderMap::new();
        headers.extend(iter);
        headers
    }
}

impl<N: Into<String>, V: Into<String>> Extend<(N, V)> for HeaderMap {
    fn extend<T: IntoIterator<Item = (N, V)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.append(name, value);
        }
    }
}
