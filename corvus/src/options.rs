//! Client configuration: server addresses, auth modes, TLS options.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use corvus_core::{ConnectInfo, ReconnectPolicy, DEFAULT_INBOX_PREFIX};
use nkeys::KeyPair;
use url::Url;

use crate::error::{ConnectionError, Error, Result};

/// Default NATS listen port.
pub const DEFAULT_PORT: u16 = 4222;

/// Credentials extracted from a server URL's user-info section.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UrlAuth {
    Token(String),
    UserPass { user: String, pass: String },
}

/// A parsed server address. Credentials found in the URL are split off
/// at parse time; `Display` and `Debug` never show them.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerAddr {
    host: String,
    port: u16,
    tls_scheme: bool,
    auth: Option<UrlAuth>,
}

impl ServerAddr {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The URL scheme selects TLS (`tls`, `nats+tls`, `wss`).
    pub fn tls_required(&self) -> bool {
        self.tls_scheme
    }

    /// Auth derived from URL user-info, if any.
    pub(crate) fn url_auth(&self) -> Option<Auth> {
        match &self.auth {
            None => None,
            Some(UrlAuth::Token(token)) => Some(Auth::Token(token.clone())),
            Some(UrlAuth::UserPass { user, pass }) => Some(Auth::UserPass {
                user: user.clone(),
                pass: pass.clone(),
            }),
        }
    }

    /// Credential-free form for logs and display.
    pub fn sanitized(&self) -> String {
        let scheme = if self.tls_scheme { "tls" } else { "nats" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sanitized())
    }
}

impl fmt::Debug for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAddr")
            .field("addr", &self.sanitized())
            .field("has_auth", &self.auth.is_some())
            .finish()
    }
}

impl FromStr for ServerAddr {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = || {
            Error::Connection(ConnectionError::InvalidUrl {
                url: input.to_owned(),
            })
        };
        // bare host[:port] is accepted as shorthand
        let with_scheme = if input.contains("://") {
            input.to_owned()
        } else {
            format!("nats://{input}")
        };
        let url = Url::parse(&with_scheme).map_err(|_| invalid())?;

        let tls_scheme = match url.scheme() {
            "nats" => false,
            "tls" | "nats+tls" | "wss" => true,
            _ => return Err(invalid()),
        };
        let host = url.host_str().ok_or_else(invalid)?.to_owned();
        let default_port = if url.scheme() == "wss" { 443 } else { DEFAULT_PORT };
        let port = url.port().unwrap_or(default_port);

        let auth = if url.username().is_empty() {
            None
        } else {
            match url.password() {
                Some(pass) => Some(UrlAuth::UserPass {
                    user: url.username().to_owned(),
                    pass: pass.to_owned(),
                }),
                None => Some(UrlAuth::Token(url.username().to_owned())),
            }
        };

        Ok(ServerAddr {
            host,
            port,
            tls_scheme,
            auth,
        })
    }
}

/// Authentication mode sent in CONNECT. The `Debug` form never shows
/// secret material.
#[derive(Clone, Default, PartialEq)]
pub enum Auth {
    #[default]
    None,
    Token(String),
    UserPass {
        user: String,
        pass: String,
    },
    /// NKey seed string (`SU...`); signs the server nonce.
    NKey {
        seed: String,
    },
    /// Path to a `.creds` file, re-read on every (re)connect so
    /// rotated credentials are picked up.
    Credentials {
        path: PathBuf,
    },
    /// Explicit JWT plus signing seed.
    Jwt {
        jwt: String,
        seed: String,
    },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Token(_) => f.write_str("Token(***)"),
            Auth::UserPass { user, .. } => write!(f, "UserPass {{ user: {user:?}, pass: *** }}"),
            Auth::NKey { .. } => f.write_str("NKey(***)"),
            Auth::Credentials { path } => write!(f, "Credentials({path:?})"),
            Auth::Jwt { .. } => f.write_str("Jwt(***)"),
        }
    }
}

impl Auth {
    /// Fill the auth fields of a CONNECT payload, signing `nonce` when
    /// the server provided one.
    pub(crate) fn apply(&self, connect: &mut ConnectInfo, nonce: Option<&str>) -> Result<()> {
        fn signed(seed: &str, nonce: Option<&str>) -> Result<(String, Option<String>)> {
            let pair = KeyPair::from_seed(seed)?;
            let sig = match nonce {
                Some(nonce) => {
                    let sig = pair.sign(nonce.as_bytes())?;
                    use base64::Engine;
                    Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig))
                }
                None => None,
            };
            Ok((pair.public_key(), sig))
        }

        match self {
            Auth::None => {}
            Auth::Token(token) => connect.auth_token = Some(token.clone()),
            Auth::UserPass { user, pass } => {
                connect.user = Some(user.clone());
                connect.pass = Some(pass.clone());
            }
            Auth::NKey { seed } => {
                let (public_key, sig) = signed(seed, nonce)?;
                connect.nkey = Some(public_key);
                connect.sig = sig;
            }
            Auth::Credentials { path } => {
                let creds = nkeys::load_creds(path)?;
                let (public_key, sig) = signed(&creds.seed, nonce)?;
                connect.jwt = Some(creds.jwt);
                connect.nkey = Some(public_key);
                connect.sig = sig;
            }
            Auth::Jwt { jwt, seed } => {
                let (public_key, sig) = signed(seed, nonce)?;
                connect.jwt = Some(jwt.clone());
                connect.nkey = Some(public_key);
                connect.sig = sig;
            }
        }
        Ok(())
    }
}

/// TLS configuration.
///
/// `enabled: None` means "follow the URL scheme and the server's
/// `tls_required` flag"; `Some(false)` refuses TLS outright and turns
/// a TLS-demanding server into a [`ConnectionError::TlsRequired`].
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub enabled: Option<bool>,
    /// Set to false to skip certificate verification. Test use only.
    pub verify: Option<bool>,
    /// Extra trust roots (PEM). Webpki roots are used otherwise.
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM) for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS.
    pub key_file: Option<PathBuf>,
    /// Override the SNI name; defaults to the server host.
    pub sni_hostname: Option<String>,
}

impl TlsOptions {
    pub(crate) fn verify_enabled(&self) -> bool {
        self.verify.unwrap_or(true)
    }
}

/// Client configuration with the defaults of the protocol.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Ordered server list; tried first to last.
    pub servers: Vec<ServerAddr>,
    /// Client name reported in CONNECT.
    pub name: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub tls: TlsOptions,
    pub auth: Auth,
    /// Keepalive PING period.
    pub ping_interval: Duration,
    /// Outstanding-PING threshold before the connection counts as stale.
    pub max_pings_out: u32,
    /// Default deadline for `request`.
    pub request_timeout: Duration,
    /// Grace period for `drain`.
    pub drain_timeout: Duration,
    /// Deadline for TCP connect + INFO + handshake per server.
    pub connection_timeout: Duration,
    /// Receive our own publishes on matching subscriptions.
    pub echo: bool,
    /// Ask the server to ack every protocol op.
    pub verbose: bool,
    /// Strict server-side protocol checking.
    pub pedantic: bool,
    /// Local payload cap; 0 defers to the server's `max_payload`.
    pub max_payload: usize,
    /// Root of the reply-inbox subject space.
    pub inbox_prefix: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222"
                .parse()
                .expect("default server address parses")],
            name: None,
            reconnect: ReconnectPolicy::default(),
            tls: TlsOptions::default(),
            auth: Auth::None,
            ping_interval: Duration::from_secs(120),
            max_pings_out: 2,
            request_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
            echo: true,
            verbose: false,
            pedantic: false,
            max_payload: 0,
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_owned(),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the server list with a single address.
    pub fn with_server(mut self, url: &str) -> Result<Self> {
        self.servers = vec![url.parse()?];
        Ok(self)
    }

    /// Replace the server list with several addresses, tried in order.
    pub fn with_servers<I, S>(mut self, urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.servers = urls
            .into_iter()
            .map(|url| url.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    /// Effective auth for a given server: explicit configuration wins,
    /// then URL user-info.
    pub(crate) fn auth_for(&self, server: &ServerAddr) -> Auth {
        if self.auth != Auth::None {
            return self.auth.clone();
        }
        server.url_auth().unwrap_or(Auth::None)
    }

    /// Assemble the CONNECT payload for a server.
    pub(crate) fn connect_info(
        &self,
        server: &ServerAddr,
        nonce: Option<&str>,
        tls_in_use: bool,
    ) -> Result<ConnectInfo> {
        let mut connect = ConnectInfo {
            verbose: self.verbose,
            pedantic: self.pedantic,
            tls_required: tls_in_use,
            echo: self.echo,
            name: self.name.clone(),
            ..ConnectInfo::default()
        };
        self.auth_for(server).apply(&mut connect, nonce)?;
        Ok(connect)
    }
}
