//! Request/reply broker: pending replies keyed by their exact inbox
//! reply subject, each completed through a oneshot slot.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::Message;

/// Pending-reply table shared between request callers and the
/// connection task.
#[derive(Default)]
pub(crate) struct RequestBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    /// SID of the `<inbox>.>` wildcard subscription, once established.
    sid: Mutex<Option<String>>,
}

impl RequestBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// SID of the inbox wildcard subscription, if it exists yet.
    pub fn subscription_sid(&self) -> Option<String> {
        self.sid.lock().clone()
    }

    /// Establish the inbox subscription exactly once: `make` runs only
    /// for the first caller, holding the slot against races.
    pub fn ensure_subscription(
        &self,
        make: impl FnOnce() -> crate::error::Result<String>,
    ) -> crate::error::Result<()> {
        let mut sid = self.sid.lock();
        if sid.is_none() {
            *sid = Some(make()?);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn set_subscription_sid(&self, sid: String) {
        *self.sid.lock() = Some(sid);
    }

    /// Park a pending request under its reply subject.
    pub fn register(&self, reply: String, tx: oneshot::Sender<Message>) {
        self.pending.lock().insert(reply, tx);
    }

    /// Remove a pending entry (timeout or cancellation path).
    pub fn remove(&self, reply: &str) -> bool {
        self.pending.lock().remove(reply).is_some()
    }

    /// Claim and complete the pending entry for an inbound reply.
    /// Returns false when nobody is waiting (late reply after timeout).
    pub fn complete(&self, reply_subject: &str, message: Message) -> bool {
        let Some(tx) = self.pending.lock().remove(reply_subject) else {
            debug!(subject = reply_subject, "reply with no pending request");
            return false;
        };
        tx.send(message).is_ok()
    }

    /// Drop every pending entry; waiting callers observe a closed slot.
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing outstanding requests");
        }
        // senders drop here; receivers see RecvError
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
