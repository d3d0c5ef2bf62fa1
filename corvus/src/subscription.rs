//! Public subscription handle: a stream of messages plus unsubscribe
//! controls.

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::trace;

use crate::client::ClientInner;
use crate::error::Result;
use crate::message::Message;

/// A subscription to a subject. Messages arrive in server order; the
/// stream ends when the subscription is unsubscribed, its
/// auto-unsubscribe limit is hit, or the client closes.
pub struct Subscription {
    sid: String,
    subject: String,
    queue_group: Option<String>,
    rx: mpsc::UnboundedReceiver<Message>,
    client: Weak<ClientInner>,
    unsubscribed: bool,
}

impl Subscription {
    pub(crate) fn new(
        sid: String,
        subject: String,
        queue_group: Option<String>,
        rx: mpsc::UnboundedReceiver<Message>,
        client: Weak<ClientInner>,
    ) -> Self {
        Self {
            sid,
            subject,
            queue_group,
            rx,
            client,
            unsubscribed: false,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Receive the next message; `None` once the subscription is done.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Stop the subscription. In-flight messages already sent by the
    /// server are absorbed silently for a short drain window.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.unsubscribed = true;
        let Some(inner) = self.client.upgrade() else {
            return Ok(());
        };
        inner.unsubscribe(&self.sid, None)?;
        inner.flush().await
    }

    /// Let the subscription deliver `max` messages in total, then end
    /// it automatically.
    pub async fn unsubscribe_after(&mut self, max: u64) -> Result<()> {
        let Some(inner) = self.client.upgrade() else {
            return Ok(());
        };
        inner.unsubscribe(&self.sid, Some(max))?;
        inner.flush().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.unsubscribed {
            return;
        }
        if let Some(inner) = self.client.upgrade() {
            trace!(sid = %self.sid, subject = %self.subject, "subscription dropped; unsubscribing");
            let _ = inner.unsubscribe(&self.sid, None);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .finish_non_exhaustive()
    }
}
