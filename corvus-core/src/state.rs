//! Connection lifecycle state machine.
//!
//! States and the legal transition table are explicit; any
//! (state, event) pair outside the table is a no-op reported as
//! [`Transition::NotTaken`] rather than an error. `Closed` is
//! terminal.

use std::fmt;

use crate::info::ServerInfo;

/// Lifecycle state of a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    TlsHandshake,
    Connected(Box<ServerInfo>),
    Reconnecting { attempt: u32 },
    Draining,
    Closed,
}

impl ConnectionState {
    /// In-flight traffic may continue in these states.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected(_) | ConnectionState::Draining
        )
    }

    /// Only `Connected` accepts new operations.
    pub fn can_accept_operations(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::TlsHandshake => "tls_handshake",
            ConnectionState::Connected(_) => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    TlsRequired,
    TlsComplete,
    Connected(Box<ServerInfo>),
    Reconnecting { attempt: u32 },
    Disconnected,
    Drain,
    Close,
}

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The event moved the machine; `from` is the state it left.
    Taken { from: ConnectionState },
    /// The (state, event) pair is not in the table; nothing changed.
    NotTaken,
}

impl Transition {
    pub fn was_taken(&self) -> bool {
        matches!(self, Transition::Taken { .. })
    }
}

/// The state machine itself. Holds the current state and applies the
/// transition table.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Apply an event. Returns whether the transition was taken.
    pub fn apply(&mut self, event: ConnectionEvent) -> Transition {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (&self.state, event) {
            (S::Disconnected, E::Connect) => S::Connecting,
            (S::Disconnected, E::Close) => S::Closed,

            (S::Connecting, E::TlsRequired) => S::TlsHandshake,
            (S::Connecting, E::Connected(info)) => S::Connected(info),
            (S::Connecting, E::Disconnected) => S::Disconnected,
            (S::Connecting, E::Close) => S::Closed,

            (S::TlsHandshake, E::TlsComplete) => S::Connecting,
            (S::TlsHandshake, E::Disconnected) => S::Disconnected,
            (S::TlsHandshake, E::Close) => S::Closed,

            (S::Connected(_), E::Disconnected) => S::Disconnected,
            (S::Connected(_), E::Reconnecting { attempt }) => S::Reconnecting { attempt },
            (S::Connected(_), E::Drain) => S::Draining,
            (S::Connected(_), E::Close) => S::Closed,

            (S::Reconnecting { .. }, E::Connected(info)) => S::Connected(info),
            (S::Reconnecting { .. }, E::Reconnecting { attempt }) => S::Reconnecting { attempt },
            (S::Reconnecting { .. }, E::Disconnected) => S::Disconnected,
            (S::Reconnecting { .. }, E::Close) => S::Closed,

            (S::Draining, E::Disconnected) => S::Disconnected,
            (S::Draining, E::Close) => S::Closed,

            _ => return Transition::NotTaken,
        };
        let from = std::mem::replace(&mut self.state, next);
        Transition::Taken { from }
    }

    /// Escape hatch for in-process error recovery. Refuses to leave
    /// `Closed`.
    pub fn force_set(&mut self, state: ConnectionState) -> bool {
        if self.state.is_closed() {
            return false;
        }
        self.state = state;
        true
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
