//! Subscription multiplexer: SID allocation, inbound routing, and the
//! short-lived drain set that absorbs in-flight frames after UNSUB.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use corvus_core::ClientOp;
use tokio::sync::mpsc;
use tracing::warn;

use crate::message::Message;

/// How long an unsubscribed SID keeps swallowing in-flight frames
/// before deliveries to it count as unknown again.
pub(crate) const DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// What happened to a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    /// Routed to a live subscription.
    Delivered,
    /// SID is draining or the manager is closed; dropped silently.
    Known,
    /// SID was never ours (or long gone); worth a log line.
    Unknown,
}

struct SubEntry {
    subject: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
    delivered: u64,
    max_messages: Option<u64>,
}

/// Owner of all subscription state. Keyed by numeric SID so iteration
/// order is registration order (SIDs are monotonic).
pub(crate) struct Multiplexer {
    subscriptions: BTreeMap<u64, SubEntry>,
    draining: HashMap<u64, Instant>,
    next_sid: u64,
    closed: bool,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            subscriptions: BTreeMap::new(),
            draining: HashMap::new(),
            next_sid: 1,
            closed: false,
        }
    }

    /// Next SID as a decimal string, starting at "1".
    pub fn generate_sid(&mut self) -> String {
        let sid = self.next_sid;
        self.next_sid += 1;
        sid.to_string()
    }

    pub fn register(
        &mut self,
        sid: &str,
        subject: String,
        queue_group: Option<String>,
        sender: mpsc::UnboundedSender<Message>,
    ) {
        let Some(sid) = parse_sid(sid) else { return };
        self.draining.remove(&sid);
        self.subscriptions.insert(
            sid,
            SubEntry {
                subject,
                queue_group,
                sender,
                delivered: 0,
                max_messages: None,
            },
        );
    }

    /// Finish the delivery channel and move the SID into the drain set.
    pub fn unregister(&mut self, sid: &str) {
        let Some(sid) = parse_sid(sid) else { return };
        self.finish_entry(sid, Instant::now());
    }

    fn finish_entry(&mut self, sid: u64, now: Instant) {
        // dropping the sender finishes the channel
        self.subscriptions.remove(&sid);
        self.draining.insert(sid, now + DRAIN_WINDOW);
    }

    /// Attach an auto-unsubscribe limit. If the limit is already met
    /// the subscription finishes immediately. Returns false for
    /// unknown SIDs.
    pub fn set_max_messages(&mut self, sid: &str, max: u64) -> bool {
        let Some(sid_num) = parse_sid(sid) else {
            return false;
        };
        let Some(entry) = self.subscriptions.get_mut(&sid_num) else {
            return false;
        };
        if entry.delivered >= max {
            self.finish_entry(sid_num, Instant::now());
        } else {
            entry.max_messages = Some(max);
        }
        true
    }

    pub fn deliver(&mut self, sid: &str, message: Message) -> DeliveryOutcome {
        self.deliver_at(sid, message, Instant::now())
    }

    fn deliver_at(&mut self, sid: &str, message: Message, now: Instant) -> DeliveryOutcome {
        self.sweep(now);
        if self.closed {
            return DeliveryOutcome::Known;
        }
        let Some(sid) = parse_sid(sid) else {
            return DeliveryOutcome::Unknown;
        };
        if self.draining.contains_key(&sid) {
            return DeliveryOutcome::Known;
        }
        let Some(entry) = self.subscriptions.get_mut(&sid) else {
            return DeliveryOutcome::Unknown;
        };
        entry.delivered += 1;
        if entry.sender.send(message).is_err() {
            // receiver side dropped without unsubscribing
            self.finish_entry(sid, now);
            return DeliveryOutcome::Known;
        }
        if entry
            .max_messages
            .is_some_and(|max| entry.delivered >= max)
        {
            self.finish_entry(sid, now);
        }
        DeliveryOutcome::Delivered
    }

    /// Finish every channel and refuse all future deliveries.
    pub fn finish_all(&mut self) {
        let now = Instant::now();
        let sids: Vec<u64> = self.subscriptions.keys().copied().collect();
        for sid in sids {
            self.finish_entry(sid, now);
        }
        self.closed = true;
    }

    /// SUB frames for every live subscription, in registration order.
    /// Sent after a successful reconnect.
    pub fn resubscribe_ops(&self) -> Vec<ClientOp> {
        self.subscriptions
            .iter()
            .map(|(sid, entry)| ClientOp::Subscribe {
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
                sid: sid.to_string(),
            })
            .collect()
    }

    /// SIDs of every live subscription, registration order.
    pub fn active_sids(&self) -> Vec<String> {
        self.subscriptions.keys().map(u64::to_string).collect()
    }

    fn sweep(&mut self, now: Instant) {
        self.draining.retain(|_, expiry| *expiry > now);
    }
}

fn parse_sid(sid: &str) -> Option<u64> {
    match sid.parse() {
        Ok(sid) => Some(sid),
        Err(_) => {
            warn!(sid, "non-numeric sid");
            None
        }
    }
}
