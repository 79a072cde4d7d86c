//! Binding between one session and one collector.

use std::fmt;

use serde::Serialize;

use crate::events::EventKind;
use crate::stats::{Counters, Rates, Statistics};
use crate::timer::TimerId;
use crate::types::{CollectorId, CollectorSessionId, ConnectionId, SessionId};

/// Collector session state. Any failure returns to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum CSState {
    #[default]
    Disconnected,
    /// Handshake done, eligible for selection.
    Ready,
    /// Receiving the session's records.
    Active,
}

impl fmt::Display for CSState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Ready => write!(f, "ready"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Result of an association request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocOutcome {
    /// A new binding was created.
    Associated(CollectorSessionId),
    /// The pair was already bound; only the priority changed.
    Reassociated(CollectorSessionId),
}

impl AssocOutcome {
    pub fn id(&self) -> CollectorSessionId {
        match self {
            Self::Associated(id) | Self::Reassociated(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CollectorSession {
    pub(crate) id: CollectorSessionId,
    pub(crate) session: SessionId,
    pub(crate) collector: CollectorId,
    /// Lower values are preferred.
    pub(crate) priority: u32,
    pub(crate) state: CSState,
    /// Connection currently carrying this binding's traffic.
    pub(crate) connection: Option<ConnectionId>,
    pub(crate) window_timer: Option<TimerId>,
    pub(crate) stats: Statistics,
    pub(crate) last_event: Option<EventKind>,
}

impl CollectorSession {
    pub(crate) fn new(
        id: CollectorSessionId,
        session: SessionId,
        collector: CollectorId,
        priority: u32,
    ) -> Self {
        Self {
            id,
            session,
            collector,
            priority,
            state: CSState::Disconnected,
            connection: None,
            window_timer: None,
            stats: Statistics::default(),
            last_event: None,
        }
    }

    /// Drops to `Disconnected`, returning the pending window timer.
    pub(crate) fn disconnect(&mut self) -> Option<TimerId> {
        self.state = CSState::Disconnected;
        self.connection = None;
        self.window_timer.take()
    }
}

/// Collector-session statistics and state, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorSessionInfo {
    pub id: CollectorSessionId,
    pub session: SessionId,
    pub collector: String,
    pub priority: u32,
    pub state: CSState,
    pub counters: Counters,
    pub rates: Rates,
    pub last_event: Option<EventKind>,
}
