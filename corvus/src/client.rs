//! The client facade: owns the socket task, the subscription
//! multiplexer, the request broker, the lifecycle state machine, and
//! the reconnection loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use corvus_core::{
    new_inbox, validate_publish, validate_queue_group, validate_subscribe, ClientOp,
    ConnectionEvent, ConnectionState, HeaderMap, ProtocolError, ServerInfo, StateMachine,
    STATUS_NO_RESPONDERS,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{self, Command, Established};
use crate::error::{ConnectionError, Error, Result};
use crate::message::Message;
use crate::multiplexer::Multiplexer;
use crate::options::ClientOptions;
use crate::request::RequestBroker;
use crate::subscription::Subscription;

/// Monotonic message counters, readable from any task.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_received: AtomicU64,
}

/// Point-in-time snapshot of the client counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub messages_sent: u64,
    pub messages_received: u64,
}

pub(crate) struct ClientInner {
    pub(crate) options: ClientOptions,
    pub(crate) state: Mutex<StateMachine>,
    pub(crate) multiplexer: Mutex<Multiplexer>,
    pub(crate) requests: RequestBroker,
    pub(crate) server_info: Mutex<Option<ServerInfo>>,
    pub(crate) last_server_error: Mutex<Option<Error>>,
    pub(crate) stats: Stats,
    pub(crate) writer: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) reconnect: Mutex<corvus_core::ReconnectState>,
}

impl ClientInner {
    fn new(options: ClientOptions) -> Self {
        Self {
            options,
            state: Mutex::new(StateMachine::new()),
            multiplexer: Mutex::new(Multiplexer::new()),
            requests: RequestBroker::new(),
            server_info: Mutex::new(None),
            last_server_error: Mutex::new(None),
            stats: Stats::default(),
            writer: Mutex::new(None),
            shutdown: CancellationToken::new(),
            reconnect: Mutex::new(corvus_core::ReconnectState::new()),
        }
    }

    /// Enqueue a protocol op onto the connection task.
    pub(crate) fn send_op(&self, op: ClientOp) -> Result<()> {
        let writer = self.writer.lock();
        let Some(tx) = writer.as_ref() else {
            return Err(ConnectionError::NotConnected.into());
        };
        tx.send(Command::Op(op))
            .map_err(|_| ConnectionError::NotConnected.into())
    }

    /// PING/PONG round trip confirming all prior writes reached the
    /// server.
    pub(crate) async fn flush(&self) -> Result<()> {
        let rx = {
            let writer = self.writer.lock();
            let Some(tx) = writer.as_ref() else {
                return Err(ConnectionError::NotConnected.into());
            };
            let (ack, rx) = oneshot::channel();
            tx.send(Command::Flush(ack))
                .map_err(|_| Error::from(ConnectionError::NotConnected))?;
            rx
        };
        rx.await.map_err(|_| ConnectionError::Closed.into())
    }

    /// Emit UNSUB and retire the local subscription state. With a max,
    /// the subscription keeps delivering until the limit is met.
    pub(crate) fn unsubscribe(&self, sid: &str, max: Option<u64>) -> Result<()> {
        self.send_op(ClientOp::Unsubscribe {
            sid: sid.to_owned(),
            max,
        })?;
        let mut mux = self.multiplexer.lock();
        match max {
            Some(max) => {
                if !mux.set_max_messages(sid, max) {
                    return Err(ProtocolError::SubscriptionNotFound {
                        sid: sid.to_owned(),
                    }
                    .into());
                }
            }
            None => mux.unregister(sid),
        }
        Ok(())
    }

    /// New operations are accepted only while `Connected`.
    fn ensure_can_operate(&self) -> Result<()> {
        let state = self.state.lock();
        match state.state() {
            ConnectionState::Closed => Err(ConnectionError::Closed.into()),
            ConnectionState::Draining => Err(ConnectionError::Draining.into()),
            s if s.can_accept_operations() => Ok(()),
            _ => Err(ConnectionError::NotConnected.into()),
        }
    }

    /// Surface a stored `-ERR` (or reconnect exhaustion) on the next
    /// call that observes it.
    fn take_server_error(&self) -> Result<()> {
        match self.last_server_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn effective_max_payload(&self) -> usize {
        if self.options.max_payload > 0 {
            return self.options.max_payload;
        }
        self.server_info
            .lock()
            .as_ref()
            .map(|info| info.max_payload)
            .unwrap_or(0)
    }

    /// Fail every pending request and finish every subscription.
    fn shutdown_tables(&self) {
        self.multiplexer.lock().finish_all();
        self.requests.fail_all();
    }

    /// Unsolicited connection loss. Kicks the reconnection loop when
    /// the policy allows, otherwise winds the client down.
    fn handle_unexpected_close(self: Arc<Self>, err: Error) {
        warn!(error = %err, "connection lost");
        if !self.state.lock().state().is_active() {
            return;
        }
        if self.options.reconnect.enabled {
            tokio::spawn(run_reconnect(self));
        } else {
            let mut state = self.state.lock();
            state.apply(ConnectionEvent::Disconnected);
            state.apply(ConnectionEvent::Close);
            drop(state);
            self.shutdown_tables();
        }
    }
}

/// Dial servers in configured order; the winner's handshake result is
/// returned. A single-server list surfaces that server's error, a
/// longer list collapses to `NoServersAvailable`.
async fn connect_any(inner: &Arc<ClientInner>) -> Result<Established> {
    let mut last_error: Option<Error> = None;
    for addr in &inner.options.servers {
        let attempt = tokio::time::timeout(
            inner.options.connection_timeout,
            connection::establish(addr, &inner.options, Some(&inner.state)),
        )
        .await;
        match attempt {
            Ok(Ok(established)) => return Ok(established),
            Ok(Err(e)) => {
                warn!(server = %addr, error = %e, "connect failed");
                last_error = Some(e);
            }
            Err(_) => {
                warn!(server = %addr, "connect timed out");
                last_error = Some(
                    ConnectionError::Timeout {
                        after: inner.options.connection_timeout,
                    }
                    .into(),
                );
            }
        }
    }
    match last_error {
        Some(e) if inner.options.servers.len() == 1 => Err(e),
        Some(_) => Err(ConnectionError::NoServersAvailable.into()),
        None => Err(ConnectionError::NoServersAvailable.into()),
    }
}

/// Hand an established connection to a fresh connection task.
fn spawn_connection(inner: &Arc<ClientInner>, established: Established) {
    let (tx, rx) = mpsc::unbounded_channel();
    *inner.writer.lock() = Some(tx);
    *inner.server_info.lock() = Some(established.info.clone());

    let task_inner = Arc::clone(inner);
    let token = inner.shutdown.clone();
    tokio::spawn(async move {
        let outcome = connection::run(established.framed, Arc::clone(&task_inner), rx, token).await;
        task_inner.writer.lock().take();
        if let Some(err) = outcome {
            task_inner.handle_unexpected_close(err);
        }
    });
}

/// The reconnection loop: backoff, redial, resubscribe.
async fn run_reconnect(inner: Arc<ClientInner>) {
    let policy = inner.options.reconnect.clone();
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        let attempt = inner.reconnect.lock().begin_attempt();
        if !policy.should_continue(attempt - 1) {
            warn!(attempts = attempt - 1, "reconnect attempts exhausted");
            *inner.last_server_error.lock() = Some(
                ConnectionError::MaxReconnectsExceeded {
                    attempts: attempt - 1,
                }
                .into(),
            );
            inner.state.lock().apply(ConnectionEvent::Close);
            inner.shutdown_tables();
            return;
        }
        inner
            .state
            .lock()
            .apply(ConnectionEvent::Reconnecting { attempt });

        let delay = policy.next_delay(attempt, &mut rand::thread_rng());
        debug!(attempt, ?delay, "reconnect backoff");
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if inner.shutdown.is_cancelled() {
            return;
        }

        match connect_any(&inner).await {
            Ok(established) => {
                let server_info = established.info.clone();
                spawn_connection(&inner, established);
                resubscribe(&inner);
                inner.reconnect.lock().reset();
                inner
                    .state
                    .lock()
                    .apply(ConnectionEvent::Connected(Box::new(server_info)));
                info!(attempt, "reconnected");
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
}

/// Replay SUB frames for every live subscription (and the request
/// inbox) on the fresh connection, in registration order.
fn resubscribe(inner: &Arc<ClientInner>) {
    let mut ops = inner.multiplexer.lock().resubscribe_ops();
    if let Some(sid) = inner.requests.subscription_sid() {
        ops.push(ClientOp::Subscribe {
            subject: format!("{}.>", inner.options.inbox_prefix),
            queue_group: None,
            sid,
        });
    }
    for op in ops {
        if let Err(e) = inner.send_op(op) {
            warn!(error = %e, "resubscribe failed");
            return;
        }
    }
}

/// Handle to a NATS connection. Cheap to clone; all clones share the
/// same connection, subscriptions, and counters.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect using the default options against
    /// `nats://localhost:4222`.
    pub async fn connect_default() -> Result<Client> {
        Self::connect(ClientOptions::default()).await
    }

    /// Connect to the first reachable configured server: TCP, INFO,
    /// optional TLS upgrade, CONNECT. Completes once CONNECT has been
    /// flushed.
    pub async fn connect(options: ClientOptions) -> Result<Client> {
        let inner = Arc::new(ClientInner::new(options));
        inner.state.lock().apply(ConnectionEvent::Connect);

        match connect_any(&inner).await {
            Ok(established) => {
                let server_info = established.info.clone();
                spawn_connection(&inner, established);
                inner
                    .state
                    .lock()
                    .apply(ConnectionEvent::Connected(Box::new(server_info)));
                info!(server = %inner.options.servers[0], "connected");
                Ok(Client { inner })
            }
            Err(e) => {
                inner.state.lock().apply(ConnectionEvent::Disconnected);
                Err(e)
            }
        }
    }

    /// Connect to a single URL with otherwise default options.
    pub async fn connect_url(url: &str) -> Result<Client> {
        Self::connect(ClientOptions::default().with_server(url)?).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state().clone()
    }

    /// INFO of the currently (or most recently) connected server.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.lock().clone()
    }

    /// Message counter snapshot.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            messages_sent: self.inner.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.stats.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Fire-and-forget publish. Not retried across reconnects: a
    /// payload accepted here but not yet written when the connection
    /// drops is lost. Use JetStream publishes for acknowledged
    /// delivery.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_message(subject, None, None, payload.into())
    }

    /// Publish with a reply-to subject.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_message(subject, Some(reply.to_owned()), None, payload.into())
    }

    /// Publish with headers (HPUB).
    pub async fn publish_with_headers(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_message(subject, None, Some(headers), payload.into())
    }

    fn publish_message(
        &self,
        subject: &str,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        validate_publish(subject)?;
        if let Some(ref reply) = reply {
            validate_publish(reply)?;
        }
        self.inner.take_server_error()?;
        self.inner.ensure_can_operate()?;

        let max = self.inner.effective_max_payload();
        if max > 0 && payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max,
            }
            .into());
        }

        self.inner.send_op(ClientOp::Publish {
            subject: subject.to_owned(),
            reply,
            headers,
            payload,
        })?;
        self.inner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Request/reply with the default timeout.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> Result<Message> {
        self.request_inner(subject, None, payload.into(), self.inner.options.request_timeout)
            .await
    }

    /// Request/reply with an explicit deadline.
    pub async fn request_with_timeout(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_inner(subject, None, payload.into(), timeout).await
    }

    /// Request with explicit headers and deadline; the JetStream layer
    /// drives its API traffic through this.
    pub(crate) async fn request_full(
        &self,
        subject: &str,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_inner(subject, headers, payload, timeout).await
    }

    /// Request carrying headers.
    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<Message> {
        self.request_inner(
            subject,
            Some(headers),
            payload.into(),
            self.inner.options.request_timeout,
        )
        .await
    }

    async fn request_inner(
        &self,
        subject: &str,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message> {
        validate_publish(subject)?;
        self.inner.take_server_error()?;
        self.inner.ensure_can_operate()?;
        self.ensure_request_subscription()?;

        let reply = new_inbox(&self.inner.options.inbox_prefix, &mut rand::thread_rng());
        let (tx, rx) = oneshot::channel();
        self.inner.requests.register(reply.clone(), tx);
        // map cleanup survives timeout, cancellation, and send errors
        let guard = PendingGuard {
            broker: &self.inner.requests,
            reply: &reply,
        };

        self.inner.send_op(ClientOp::Publish {
            subject: subject.to_owned(),
            reply: Some(reply.clone()),
            headers,
            payload,
        })?;
        self.inner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        match outcome {
            Ok(Ok(message)) => {
                if message.status() == Some(STATUS_NO_RESPONDERS) {
                    return Err(ProtocolError::NoResponders {
                        subject: subject.to_owned(),
                    }
                    .into());
                }
                Ok(message)
            }
            Ok(Err(_)) => Err(ConnectionError::Closed.into()),
            Err(_) => Err(ConnectionError::Timeout { after: timeout }.into()),
        }
    }

    /// First request on a connection subscribes to `<inbox>.>`.
    fn ensure_request_subscription(&self) -> Result<()> {
        let inner = &self.inner;
        inner.requests.ensure_subscription(|| {
            let sid = inner.multiplexer.lock().generate_sid();
            inner.send_op(ClientOp::Subscribe {
                subject: format!("{}.>", inner.options.inbox_prefix),
                queue_group: None,
                sid: sid.clone(),
            })?;
            Ok(sid)
        })
    }

    /// Subscribe to a subject (wildcards allowed).
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, None)
    }

    /// Subscribe as part of a queue group: each message goes to exactly
    /// one member of the group.
    pub async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<Subscription> {
        validate_queue_group(queue_group)?;
        self.subscribe_inner(subject, Some(queue_group.to_owned()))
    }

    fn subscribe_inner(&self, subject: &str, queue_group: Option<String>) -> Result<Subscription> {
        validate_subscribe(subject)?;
        self.inner.take_server_error()?;
        self.inner.ensure_can_operate()?;

        let (sid, rx) = {
            let mut mux = self.inner.multiplexer.lock();
            let sid = mux.generate_sid();
            let (tx, rx) = mpsc::unbounded_channel();
            mux.register(&sid, subject.to_owned(), queue_group.clone(), tx);
            (sid, rx)
        };

        if let Err(e) = self.inner.send_op(ClientOp::Subscribe {
            subject: subject.to_owned(),
            queue_group: queue_group.clone(),
            sid: sid.clone(),
        }) {
            self.inner.multiplexer.lock().unregister(&sid);
            return Err(e);
        }

        Ok(Subscription::new(
            sid,
            subject.to_owned(),
            queue_group,
            rx,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Confirm all prior writes reached the server (PING/PONG round
    /// trip).
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Graceful shutdown: stop accepting operations, unsubscribe
    /// everything, let in-flight work settle within `drain_timeout`,
    /// then close.
    pub async fn drain(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match state.state() {
                ConnectionState::Draining => return Err(ConnectionError::Draining.into()),
                s if !s.is_active() => return Err(ConnectionError::NotConnected.into()),
                _ => {}
            }
            state.apply(ConnectionEvent::Drain);
        }

        let sids = self.inner.multiplexer.lock().active_sids();
        debug!(subscriptions = sids.len(), "draining");
        for sid in &sids {
            let _ = self.inner.send_op(ClientOp::Unsubscribe {
                sid: sid.clone(),
                max: None,
            });
        }
        if let Some(sid) = self.inner.requests.subscription_sid() {
            let _ = self.inner.send_op(ClientOp::Unsubscribe { sid, max: None });
        }
        let _ = self.inner.flush().await;

        let deadline = Instant::now() + self.inner.options.drain_timeout;
        while self.inner.requests.pending_count() > 0 && Instant::now() < deadline {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        {
            let mut mux = self.inner.multiplexer.lock();
            for sid in &sids {
                mux.unregister(sid);
            }
        }
        self.close().await
    }

    /// Terminal shutdown. Idempotent and safe to race: every path ends
    /// in `Closed` with all subscriptions finished and all pending
    /// requests failed.
    pub async fn close(&self) -> Result<()> {
        self.inner.state.lock().apply(ConnectionEvent::Close);
        self.inner.shutdown.cancel();
        self.inner.shutdown_tables();
        self.inner.writer.lock().take();
        debug!("client closed");
        Ok(())
    }

    /// JetStream entry point.
    pub fn jetstream(&self) -> crate::jetstream::Context {
        crate::jetstream::Context::new(self.clone())
    }

    pub(crate) fn inbox_prefix(&self) -> &str {
        &self.inner.options.inbox_prefix
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.inner.state.lock().state().to_string())
            .field("servers", &self.inner.options.servers)
            .finish_non_exhaustive()
    }
}

/// Removes the pending entry when a request path unwinds early
/// (timeout or caller cancellation).
struct PendingGuard<'a> {
    broker: &'a RequestBroker,
    reply: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.broker.remove(self.reply);
    }
}
