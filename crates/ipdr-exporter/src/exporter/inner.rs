//! State guarded by the exporter lock.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::collector::Collector;
use crate::collector_session::CollectorSession;
use crate::config::{ExporterConfig, ParameterStore};
use crate::error::{ExporterError, ExporterResult};
use crate::events::Event;
use crate::protocol::ProtocolHandler;
use crate::queue::RecordQueue;
use crate::session::Session;
use crate::template::ConfigurationIdCallbacks;
use crate::timer::{Clock, TimerId, TimerQueue};
use crate::transport::Transport;
use crate::types::{
    CollectorId, CollectorSessionId, ConnectionId, HandleAllocator, SessionId, TransportHandle,
};

pub(crate) struct ExporterInner {
    pub(crate) params: ParameterStore,
    pub(crate) config: ExporterConfig,
    pub(crate) started: bool,
    pub(crate) boot_time: DateTime<Utc>,

    pub(crate) sessions: BTreeMap<SessionId, Session>,
    pub(crate) collectors: BTreeMap<CollectorId, Collector>,
    pub(crate) collector_sessions: BTreeMap<CollectorSessionId, CollectorSession>,
    /// Live transport handles and the connection each belongs to.
    pub(crate) handles: HashMap<TransportHandle, (CollectorId, ConnectionId)>,

    pub(crate) collector_ids: HandleAllocator,
    pub(crate) cs_ids: HandleAllocator,
    pub(crate) connection_ids: HandleAllocator,

    pub(crate) queue: Box<dyn RecordQueue>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) protocol: Arc<dyn ProtocolHandler>,
    pub(crate) config_ids: Arc<dyn ConfigurationIdCallbacks>,
    pub(crate) clock: Arc<dyn Clock>,

    pub(crate) timers: TimerQueue,
    /// Statistics and autoconnect timers.
    pub(crate) periodic: Vec<TimerId>,

    /// Events raised under the lock, dispatched once it is released.
    pub(crate) pending_events: Vec<Event>,
}

impl ExporterInner {
    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Logs an event and buffers it for dispatch.
    pub(crate) fn emit(&mut self, event: Event) {
        event.log();
        self.pending_events.push(event);
    }

    pub(crate) fn cancel_timer(&mut self, timer: Option<TimerId>) {
        if let Some(id) = timer {
            self.timers.cancel(id);
        }
    }

    pub(crate) fn session(&self, id: SessionId) -> ExporterResult<&Session> {
        self.sessions.get(&id).ok_or(ExporterError::SessionNotFound(id))
    }

    pub(crate) fn session_mut(&mut self, id: SessionId) -> ExporterResult<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or(ExporterError::SessionNotFound(id))
    }

    pub(crate) fn collector_by_name(&self, name: &str) -> ExporterResult<CollectorId> {
        self.collectors
            .values()
            .find(|c| c.name == name)
            .map(|c| c.id)
            .ok_or_else(|| ExporterError::CollectorNotFound(name.to_string()))
    }

    pub(crate) fn collector_name(&self, id: CollectorId) -> String {
        self.collectors
            .get(&id)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    /// The binding between `session` and `collector`, if any.
    pub(crate) fn find_cs(&self, session: SessionId, collector: CollectorId) -> Option<CollectorSessionId> {
        self.collector_sessions
            .values()
            .find(|cs| cs.session == session && cs.collector == collector)
            .map(|cs| cs.id)
    }

    pub(crate) fn cs_collector_name(&self, cs: CollectorSessionId) -> String {
        self.collector_sessions
            .get(&cs)
            .map(|cs| self.collector_name(cs.collector))
            .unwrap_or_default()
    }

    pub(crate) fn connection_of(&self, handle: TransportHandle) -> ExporterResult<(CollectorId, ConnectionId)> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or(ExporterError::ConnectionNotFound(handle))
    }

    /// Transport handle of the connection carrying `cs`, if it is up.
    pub(crate) fn cs_handle(&self, cs: CollectorSessionId) -> Option<TransportHandle> {
        let cs = self.collector_sessions.get(&cs)?;
        let conn = self
            .collectors
            .get(&cs.collector)?
            .connection(cs.connection?)?;
        if conn.is_connected() {
            conn.handle
        } else {
            None
        }
    }

    pub(crate) fn cs_peer(&self, cs: CollectorSessionId) -> Option<SocketAddr> {
        let cs = self.collector_sessions.get(&cs)?;
        let collector = self.collectors.get(&cs.collector)?;
        cs.connection
            .and_then(|id| collector.connection(id))
            .and_then(|c| c.peer)
            .or(Some(collector.socket_addr()))
    }

    /// (outstanding, unacknowledged) for a session.
    pub(crate) fn queue_counts(&self, session: SessionId) -> (usize, usize) {
        (self.queue.outstanding(session), self.queue.unacknowledged(session))
    }

    /// Takes the buffered events.
    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }
}
