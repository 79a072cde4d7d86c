//! Protocol strategy seam.
//!
//! The exporter core owns state machines and the queue; it delegates the
//! choice of collector and the wording of control messages to a
//! [`ProtocolHandler`]. [`BasicProtocol`] speaks plain IPDR/SP.

mod basic;

use std::time::Duration;

use chrono::{DateTime, Utc};
use ipdr_wire::SessionStopReason;
use uuid::Uuid;

use crate::collector_session::CSState;
use crate::config::ExporterConfig;
use crate::transport::{Transport, TransportError};
use crate::types::{CollectorSessionId, SessionId, TransportHandle};

pub use basic::BasicProtocol;

/// A collector session the selector may pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: CollectorSessionId,
    pub collector: String,
    pub priority: u32,
    pub state: CSState,
}

/// Everything a SESSION_START needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStartInfo {
    pub session: SessionId,
    pub first_dsn: u64,
    pub dropped: u64,
    pub primary: bool,
    pub window_size: u32,
    pub window_timeout: Duration,
    pub document_id: Uuid,
    pub boot_time: DateTime<Utc>,
}

/// Protocol behavior plugged into the exporter core.
///
/// Methods run with the exporter lock held and must not call back into the
/// exporter.
pub trait ProtocolHandler: Send + Sync {
    /// Called once a connection is established, before any session traffic.
    fn on_connected(
        &self,
        transport: &dyn Transport,
        handle: TransportHandle,
        config: &ExporterConfig,
    ) -> Result<(), TransportError>;

    /// Picks the collector session to activate. The default prefers the
    /// lowest priority value, then the oldest binding.
    fn select_collector(&self, _session: SessionId, candidates: &[Candidate]) -> Option<CollectorSessionId> {
        candidates
            .iter()
            .filter(|c| c.state == CSState::Ready)
            .min_by_key(|c| (c.priority, c.id))
            .map(|c| c.id)
    }

    fn send_session_start(
        &self,
        transport: &dyn Transport,
        handle: TransportHandle,
        start: &SessionStartInfo,
    ) -> Result<(), TransportError>;

    fn send_session_stop(
        &self,
        transport: &dyn Transport,
        handle: TransportHandle,
        session: SessionId,
        reason: SessionStopReason,
    ) -> Result<(), TransportError>;

    fn send_keep_alive(&self, transport: &dyn Transport, handle: TransportHandle) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Selector;

    impl ProtocolHandler for Selector {
        fn on_connected(&self, _: &dyn Transport, _: TransportHandle, _: &ExporterConfig) -> Result<(), TransportError> {
            Ok(())
        }

        fn send_session_start(&self, _: &dyn Transport, _: TransportHandle, _: &SessionStartInfo) -> Result<(), TransportError> {
            Ok(())
        }

        fn send_session_stop(
            &self,
            _: &dyn Transport,
            _: TransportHandle,
            _: SessionId,
            _: SessionStopReason,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn send_keep_alive(&self, _: &dyn Transport, _: TransportHandle) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn candidate(id: u32, priority: u32, state: CSState) -> Candidate {
        Candidate {
            id: CollectorSessionId(id),
            collector: format!("C{}", id),
            priority,
            state,
        }
    }

    #[test]
    fn test_default_selection_prefers_lowest_priority() {
        let candidates = vec![
            candidate(1, 20, CSState::Ready),
            candidate(2, 10, CSState::Ready),
            candidate(3, 5, CSState::Disconnected),
        ];
        assert_eq!(
            Selector.select_collector(SessionId(1), &candidates),
            Some(CollectorSessionId(2))
        );
    }

    #[test]
    fn test_default_selection_breaks_ties_by_age() {
        let candidates = vec![candidate(4, 10, CSState::Ready), candidate(2, 10, CSState::Ready)];
        assert_eq!(
            Selector.select_collector(SessionId(1), &candidates),
            Some(CollectorSessionId(2))
        );
        assert_eq!(Selector.select_collector(SessionId(1), &[]), None);
    }
}
