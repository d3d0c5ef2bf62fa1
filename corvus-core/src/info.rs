//! INFO / CONNECT handshake payloads.

use serde::{Deserialize, Serialize};

/// Server `INFO` payload, decoded once per connection and immutable
/// afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: i32,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub auth_required: bool,
    /// Nonce to sign when NKey/JWT auth is in play.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Other cluster members, parsed but not dialed.
    #[serde(default)]
    pub connect_urls: Vec<String>,
    /// Server understands HPUB/HMSG.
    #[serde(default)]
    pub headers: bool,
    /// JetStream is enabled for this account.
    #[serde(default)]
    pub jetstream: bool,
    #[serde(default)]
    pub lame_duck_mode: bool,
}

/// Client `CONNECT` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    pub echo: bool,
    pub headers: bool,
    pub no_responders: bool,
    pub protocol: i32,
    pub lang: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            echo: true,
            // always advertised; required for status headers and
            // no-responder 503s
            headers: true,
            no_responders: true,
            protocol: 1,
            lang: "rust".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            name: None,
            auth_token: None,
            user: None,
            pass: None,
            nkey: None,
            sig: None,
            jwt: None,
        }
    }
}
