//! Asynchronous exporter events.
//!
//! Events raised while the exporter lock is held are buffered and handed to
//! the registered [`EventHandler`]s only after the lock is released, so a
//! handler may call back into the exporter API.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Why a collector was reported as disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The first connection attempt failed.
    Initial,
    /// No acknowledgment or keep-alive within the configured interval.
    Timeout,
    /// The TCP connection was closed or reset.
    Tcp,
    /// The exporter is stopping.
    Stop,
    /// The collector cannot keep up with the record rate.
    TooSlow,
}

/// Reason attached to a generic error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorReason {
    UnknownSession,
    UnknownServer,
}

/// The closed set of exporter events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ServerConnected,
    AllServersDisconnected,
    ServerDisconnected(DisconnectReason),
    RecordLost,
    ActiveCollectorChanged,
    QueueEmpty,
    Error(ErrorReason),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerConnected => write!(f, "ServerConnected"),
            Self::AllServersDisconnected => write!(f, "AllServersDisconnected"),
            Self::ServerDisconnected(reason) => write!(f, "ServerDisconnected({:?})", reason),
            Self::RecordLost => write!(f, "RecordLost"),
            Self::ActiveCollectorChanged => write!(f, "ActiveCollectorChanged"),
            Self::QueueEmpty => write!(f, "QueueEmpty"),
            Self::Error(reason) => write!(f, "Error({:?})", reason),
        }
    }
}

/// One delivered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub session: Option<SessionId>,
    /// Collector name.
    pub collector: Option<String>,
    pub peer: Option<SocketAddr>,
    /// Records queued but not yet transmitted.
    pub outstanding: usize,
    /// Records transmitted but not yet acknowledged.
    pub unacknowledged: usize,
    /// Records dropped, for `RecordLost`.
    pub lost: u64,
}

impl Event {
    pub fn new(kind: EventKind, severity: Severity) -> Self {
        Self {
            kind,
            severity,
            timestamp: Utc::now(),
            session: None,
            collector: None,
            peer: None,
            outstanding: 0,
            unacknowledged: 0,
            lost: 0,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_collector(mut self, name: impl Into<String>) -> Self {
        self.collector = Some(name.into());
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_counts(mut self, outstanding: usize, unacknowledged: usize) -> Self {
        self.outstanding = outstanding;
        self.unacknowledged = unacknowledged;
        self
    }

    pub fn with_lost(mut self, lost: u64) -> Self {
        self.lost = lost;
        self
    }

    pub(crate) fn log(&self) {
        let session = self.session.map(|s| s.0);
        let collector = self.collector.as_deref().unwrap_or("");
        match self.severity {
            Severity::Info => tracing::info!(
                event = %self.kind,
                session = ?session,
                collector,
                outstanding = self.outstanding,
                unacknowledged = self.unacknowledged,
                "exporter event"
            ),
            Severity::Warning => tracing::warn!(
                event = %self.kind,
                session = ?session,
                collector,
                peer = ?self.peer,
                outstanding = self.outstanding,
                unacknowledged = self.unacknowledged,
                lost = self.lost,
                "exporter event"
            ),
            Severity::Error => tracing::error!(
                event = %self.kind,
                session = ?session,
                collector,
                peer = ?self.peer,
                "exporter event"
            ),
        }
    }
}

/// Receives exporter events outside the exporter lock.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Handler that records every event it receives.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventHandler for EventLog {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new(EventKind::ServerDisconnected(DisconnectReason::Timeout), Severity::Warning)
            .with_session(SessionId(1))
            .with_collector("C1")
            .with_counts(2, 3);

        assert_eq!(event.session, Some(SessionId(1)));
        assert_eq!(event.collector.as_deref(), Some("C1"));
        assert_eq!(event.outstanding, 2);
        assert_eq!(event.unacknowledged, 3);
        assert_eq!(event.kind.to_string(), "ServerDisconnected(Timeout)");
    }

    #[test]
    fn test_event_log_counts() {
        let log = EventLog::new();
        log.on_event(&Event::new(EventKind::QueueEmpty, Severity::Info));
        log.on_event(&Event::new(EventKind::RecordLost, Severity::Warning));
        log.on_event(&Event::new(EventKind::QueueEmpty, Severity::Info));

        assert_eq!(log.count(EventKind::QueueEmpty), 2);
        assert_eq!(log.kinds().len(), 3);
        log.clear();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_closure_handler() {
        let seen = std::sync::Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let handler = move |_: &Event| *counter.lock() += 1;
        handler.on_event(&Event::new(EventKind::ServerConnected, Severity::Info));
        assert_eq!(*seen.lock(), 1);
    }
}
