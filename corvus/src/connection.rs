//! Socket ownership: TCP/TLS transport, the INFO/CONNECT handshake,
//! and the connection task that pumps frames in both directions.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use corvus_core::{ClientOp, Codec, ServerInfo, ServerOp};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::ClientInner;
use crate::error::{ConnectionError, Error, Result};
use crate::message::Message;
use crate::multiplexer::DeliveryOutcome;
use crate::options::{ClientOptions, ServerAddr};
use crate::tls;

/// The byte stream under the codec: plain TCP or TLS-upgraded.
pub(crate) enum Transport {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Commands the client hands to the connection task.
pub(crate) enum Command {
    /// Write one protocol op.
    Op(ClientOp),
    /// PING the server and complete once the matching PONG arrives.
    Flush(oneshot::Sender<()>),
}

/// A fully handshaken connection, ready to be driven.
pub(crate) struct Established {
    pub framed: Framed<Transport, Codec>,
    pub info: ServerInfo,
}

fn classify_dial_error(addr: &ServerAddr, err: std::io::Error) -> Error {
    use std::io::ErrorKind;
    let conn = match err.kind() {
        ErrorKind::ConnectionRefused => ConnectionError::ConnectionRefused {
            host: addr.host().to_owned(),
            port: addr.port(),
        },
        ErrorKind::TimedOut => ConnectionError::Timeout {
            after: std::time::Duration::ZERO,
        },
        _ if err.to_string().contains("lookup") => ConnectionError::DnsResolutionFailed {
            host: addr.host().to_owned(),
        },
        _ => ConnectionError::Io {
            reason: err.to_string(),
        },
    };
    Error::Connection(conn)
}

/// Dial one server: TCP connect, wait for INFO, upgrade to TLS when
/// called for, send CONNECT. TLS is decided only after INFO so
/// `tls_required` and the SNI name are honored. When a state machine
/// is supplied, the TLS leg is reflected through it.
pub(crate) async fn establish(
    addr: &ServerAddr,
    options: &ClientOptions,
    state: Option<&parking_lot::Mutex<corvus_core::StateMachine>>,
) -> Result<Established> {
    debug!(server = %addr, "dialing");
    let tcp = TcpStream::connect((addr.host(), addr.port()))
        .await
        .map_err(|e| classify_dial_error(addr, e))?;
    tcp.set_nodelay(true).ok();

    let mut framed = Framed::new(Transport::Tcp(tcp), Codec);
    let info = wait_for_info(&mut framed).await?;

    let use_tls = match options.tls.enabled {
        Some(true) => true,
        Some(false) => {
            if info.tls_required {
                return Err(ConnectionError::TlsRequired.into());
            }
            false
        }
        None => addr.tls_required() || info.tls_required,
    };

    let mut framed = if use_tls {
        if let Some(state) = state {
            state
                .lock()
                .apply(corvus_core::ConnectionEvent::TlsRequired);
        }
        let parts = framed.into_parts();
        let Transport::Tcp(tcp) = parts.io else {
            // the pre-INFO transport is always plain TCP
            return Err(ConnectionError::Io {
                reason: "transport already upgraded".into(),
            }
            .into());
        };
        let tls_stream = tls::upgrade(&options.tls, addr.host(), tcp).await?;
        if let Some(state) = state {
            state
                .lock()
                .apply(corvus_core::ConnectionEvent::TlsComplete);
        }
        let mut upgraded =
            FramedParts::new::<ClientOp>(Transport::Tls(Box::new(tls_stream)), Codec);
        upgraded.read_buf = parts.read_buf;
        upgraded.write_buf = parts.write_buf;
        Framed::from_parts(upgraded)
    } else {
        framed
    };

    let connect = options.connect_info(addr, info.nonce.as_deref(), use_tls)?;
    framed
        .send(ClientOp::Connect(connect))
        .await
        .map_err(Error::from)?;
    debug!(server = %addr, tls = use_tls, "connect flushed");

    Ok(Established { framed, info })
}

/// Turn a server `-ERR` into the matching typed error.
pub(crate) fn classify_server_error(message: &str) -> Error {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("authorization violation") || lowered.contains("authentication") {
        return ConnectionError::AuthenticationFailed {
            reason: message.to_owned(),
        }
        .into();
    }
    if lowered.contains("permissions violation") {
        // e.g. Permissions Violation for Publish to "forbidden.subject"
        let op = if lowered.contains("subscription") {
            "subscribe"
        } else {
            "publish"
        };
        let subject = message
            .split('"')
            .nth(1)
            .unwrap_or("")
            .to_owned();
        return corvus_core::ProtocolError::PermissionViolation {
            op: op.to_owned(),
            subject,
        }
        .into();
    }
    corvus_core::ProtocolError::ServerError {
        message: message.to_owned(),
    }
    .into()
}

async fn wait_for_info(framed: &mut Framed<Transport, Codec>) -> Result<ServerInfo> {
    loop {
        match framed.next().await {
            Some(Ok(ServerOp::Info(info))) => return Ok(*info),
            Some(Ok(ServerOp::Ping)) => framed.send(ClientOp::Pong).await.map_err(Error::from)?,
            Some(Ok(ServerOp::Err(message))) => return Err(classify_server_error(&message)),
            Some(Ok(other)) => {
                trace!(?other, "ignoring pre-INFO frame");
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ConnectionError::Io {
                    reason: "connection closed before INFO".into(),
                }
                .into())
            }
        }
    }
}

/// Drive one established connection until it dies or the token fires.
/// Returns the error that killed it, or `None` for a deliberate stop.
pub(crate) async fn run(
    mut framed: Framed<Transport, Codec>,
    inner: Arc<ClientInner>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
) -> Option<Error> {
    let ping_interval = inner.options.ping_interval;
    let mut pings = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );
    pings.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut outstanding_pings: u32 = 0;
    let mut pong_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut lame_duck = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = framed.close().await;
                return None;
            }

            command = commands.recv() => match command {
                Some(Command::Op(op)) => {
                    if let Err(e) = framed.send(op).await {
                        return Some(e.into());
                    }
                }
                Some(Command::Flush(ack)) => {
                    pong_waiters.push(ack);
                    if let Err(e) = framed.send(ClientOp::Ping).await {
                        return Some(e.into());
                    }
                }
                // client handle dropped
                None => {
                    let _ = framed.close().await;
                    return None;
                }
            },

            _ = pings.tick() => {
                outstanding_pings += 1;
                if outstanding_pings > inner.options.max_pings_out {
                    warn!(outstanding_pings, "connection is stale");
                    let _ = framed.close().await;
                    return Some(corvus_core::ProtocolError::StaleConnection.into());
                }
                if let Err(e) = framed.send(ClientOp::Ping).await {
                    return Some(e.into());
                }
            }

            frame = framed.next() => match frame {
                Some(Ok(op)) => {
                    if let Some(err) =
                        handle_server_op(op, &inner, &mut framed, &mut outstanding_pings,
                            &mut pong_waiters, &mut lame_duck).await
                    {
                        return Some(err);
                    }
                }
                Some(Err(e)) => return Some(e.into()),
                None => {
                    return Some(if lame_duck {
                        ConnectionError::ServerShuttingDown.into()
                    } else {
                        ConnectionError::Io {
                            reason: "connection reset by server".into(),
                        }
                        .into()
                    });
                }
            },
        }
    }
}

async fn handle_server_op(
    op: ServerOp,
    inner: &Arc<ClientInner>,
    framed: &mut Framed<Transport, Codec>,
    outstanding_pings: &mut u32,
    pong_waiters: &mut Vec<oneshot::Sender<()>>,
    lame_duck: &mut bool,
) -> Option<Error> {
    match op {
        ServerOp::Ping => {
            if let Err(e) = framed.send(ClientOp::Pong).await {
                return Some(e.into());
            }
        }
        ServerOp::Pong => {
            *outstanding_pings = 0;
            for waiter in pong_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        ServerOp::Msg {
            subject,
            sid,
            reply,
            headers,
            payload,
        } => {
            inner.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            let message = Message {
                subject,
                reply,
                headers,
                payload,
            };
            if inner.requests.subscription_sid().as_deref() == Some(sid.as_str()) {
                let reply_subject = message.subject.clone();
                let claimed = inner.requests.complete(&reply_subject, message);
                if !claimed {
                    trace!("reply arrived after its request was abandoned");
                }
            } else {
                let outcome = inner.multiplexer.lock().deliver(&sid, message);
                if outcome == DeliveryOutcome::Unknown {
                    debug!(sid, "message for unknown sid");
                }
            }
        }
        ServerOp::Info(info) => {
            debug!(server_id = %info.server_id, "received updated INFO");
            *lame_duck = info.lame_duck_mode;
            *inner.server_info.lock() = Some(*info);
        }
        ServerOp::Err(message) => {
            warn!(%message, "server error");
            *inner.last_server_error.lock() = Some(classify_server_error(&message));
        }
        ServerOp::Ok => {}
    }
    None
}
