//! Exported record flows.
//!
//! `running` is orthogonal to collector connectivity: a session may run while
//! no collector is active yet. `active_cs` names the single collector session
//! currently receiving records and is only ever set while `running` holds.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::stats::{Counters, Rates, Statistics};
use crate::template::{ContextChain, Template};
use crate::types::{CollectorSessionId, SessionId};

/// Result of a session stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SESSION_STOP was sent to the active collector, or at least attempted.
    Stopped,
    /// No collector was active, so there was nobody to notify.
    LogicallyStopped,
}

#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) document_id: Uuid,
    pub(crate) negotiable: bool,
    pub(crate) templates: BTreeMap<u16, Template>,
    pub(crate) contexts: ContextChain,
    pub(crate) collector_sessions: Vec<CollectorSessionId>,
    pub(crate) active_cs: Option<CollectorSessionId>,
    /// Collector session still draining after `running` was cleared.
    pub(crate) stopping_cs: Option<CollectorSessionId>,
    /// Next DSN to assign.
    pub(crate) dsn: u64,
    pub(crate) running: bool,
    pub(crate) sending_data: bool,
    pub(crate) resync_needed: bool,
    pub(crate) stats: Statistics,
}

impl Session {
    pub(crate) fn new(id: SessionId, name: String, description: String) -> Self {
        Self {
            id,
            name,
            description,
            document_id: Uuid::new_v4(),
            negotiable: false,
            templates: BTreeMap::new(),
            contexts: ContextChain::default(),
            collector_sessions: Vec::new(),
            active_cs: None,
            stopping_cs: None,
            dsn: 0,
            running: false,
            sending_data: false,
            resync_needed: false,
            stats: Statistics::default(),
        }
    }

    /// Collector session that records flow to: the active one, or the one
    /// being drained by a stop in progress.
    pub(crate) fn transmitting_cs(&self) -> Option<CollectorSessionId> {
        self.active_cs.or(self.stopping_cs)
    }

    pub(crate) fn reset_templates(&mut self) {
        for template in self.templates.values_mut() {
            template.reset();
        }
    }

    pub(crate) fn unlink_collector_session(&mut self, cs: CollectorSessionId) {
        self.collector_sessions.retain(|id| *id != cs);
        if self.active_cs == Some(cs) {
            self.active_cs = None;
        }
        if self.stopping_cs == Some(cs) {
            self.stopping_cs = None;
        }
    }
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub description: String,
    pub document_id: Uuid,
    pub negotiable: bool,
    pub running: bool,
    /// Next DSN to be assigned.
    pub dsn: u64,
    pub resync_needed: bool,
    /// Name of the active collector.
    pub active_collector: Option<String>,
    pub active_collector_session: Option<CollectorSessionId>,
    pub templates: Vec<u16>,
    /// Configuration ids of live contexts, oldest first.
    pub configuration_ids: Vec<u16>,
    pub collector_sessions: Vec<CollectorSessionId>,
}

/// Session statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    pub session: SessionId,
    pub counters: Counters,
    pub rates: Rates,
    pub outstanding: usize,
    pub unacknowledged: usize,
}
