//! Session management and queue draining.

use std::time::{Duration, Instant};

use ipdr_wire::SessionStopReason;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{audit_result, Exporter, ExporterInner};
use crate::audit::{AuditCategory, AuditObject, AuditRecord};
use crate::collector_session::CSState;
use crate::error::{ExporterError, ExporterResult};
use crate::events::{Event, EventKind, Severity};
use crate::session::{Session, SessionInfo, SessionStatistics, StopOutcome};
use crate::template::TransmissionContext;
use crate::types::{CollectorSessionId, SessionId};

/// Progress of a drain wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Drained,
    Pending,
    /// Records remain but nothing can carry them.
    Stalled,
}

impl Exporter {
    pub fn create_session(&self, id: SessionId, name: &str, description: &str) -> ExporterResult<()> {
        let result = self.locked(|inner| {
            if inner.sessions.contains_key(&id) {
                return Err(ExporterError::SessionExists(id));
            }
            inner
                .sessions
                .insert(id, Session::new(id, name.to_string(), description.to_string()));
            Ok(())
        });
        audit_result(
            AuditRecord::new(AuditCategory::Provisioning, "create_session")
                .object(AuditObject::Session)
                .id(id.to_string())
                .details(serde_json::json!({ "name": name })),
            &result,
        );
        result
    }

    /// Removes a stopped session and every association it has.
    pub fn delete_session(&self, id: SessionId) -> ExporterResult<()> {
        let result = self.locked(|inner| inner.delete_session(id));
        audit_result(
            AuditRecord::new(AuditCategory::Decommission, "delete_session")
                .object(AuditObject::Session)
                .id(id.to_string()),
            &result,
        );
        result
    }

    /// Marks a session running and activates a collector if one is ready.
    pub fn start_session(&self, id: SessionId) -> ExporterResult<()> {
        let result = self.locked(|inner| inner.start_session(id));
        audit_result(
            AuditRecord::new(AuditCategory::Lifecycle, "start_session")
                .object(AuditObject::Session)
                .id(id.to_string()),
            &result,
        );
        result
    }

    /// Stops a session.
    ///
    /// The session stops accepting records at once. If a collector is
    /// active, the queue is drained (best effort, bounded by `timeout`, zero
    /// meaning no bound) before SESSION_STOP is sent.
    pub fn stop_session(
        &self,
        id: SessionId,
        reason: SessionStopReason,
        timeout: Duration,
    ) -> ExporterResult<StopOutcome> {
        let result = self.stop_session_inner(id, reason, timeout);
        audit_result(
            AuditRecord::new(AuditCategory::Lifecycle, "stop_session")
                .object(AuditObject::Session)
                .id(id.to_string())
                .details(serde_json::json!({ "reason": reason.code() })),
            &result,
        );
        result
    }

    fn stop_session_inner(
        &self,
        id: SessionId,
        reason: SessionStopReason,
        timeout: Duration,
    ) -> ExporterResult<StopOutcome> {
        let draining = self.locked(|inner| inner.begin_stop(id))?;
        if draining {
            if let Err(e) = self.drain(Some(id), timeout, true) {
                warn!(session = id.0, error = %e, "queue not drained before session stop");
            }
        }
        Ok(self.locked(|inner| inner.finish_stop_session(id, reason)))
    }

    /// Builds a new transmission context from the session's templates.
    /// Returns the new configuration id.
    pub fn apply_templates(&self, id: SessionId) -> ExporterResult<u16> {
        let result = self.locked(|inner| {
            let session = inner.session_mut(id)?;
            if session.running {
                return Err(ExporterError::SessionRunning(id));
            }
            session.reset_templates();
            inner.new_context(id)
        });
        audit_result(
            AuditRecord::new(AuditCategory::Configuration, "apply_templates")
                .object(AuditObject::Session)
                .id(id.to_string()),
            &result,
        );
        result
    }

    /// Sets the document id announced in SESSION_START. Rejected while the
    /// session is running.
    pub fn set_document_id(&self, id: SessionId, document_id: Uuid) -> ExporterResult<()> {
        self.locked(|inner| {
            inner.stopped_session_mut(id)?.document_id = document_id;
            Ok(())
        })
    }

    /// Allows or forbids collector-driven template negotiation. Rejected
    /// while the session is running.
    pub fn set_negotiable(&self, id: SessionId, negotiable: bool) -> ExporterResult<()> {
        self.locked(|inner| {
            inner.stopped_session_mut(id)?.negotiable = negotiable;
            Ok(())
        })
    }

    pub fn get_session(&self, id: SessionId) -> ExporterResult<SessionInfo> {
        self.locked(|inner| inner.session_info(id))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.locked(|inner| {
            let ids: Vec<SessionId> = inner.sessions.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| inner.session_info(id).ok())
                .collect()
        })
    }

    pub fn get_session_statistics(&self, id: SessionId) -> ExporterResult<SessionStatistics> {
        self.locked(|inner| {
            let now = inner.now();
            let (outstanding, unacknowledged) = inner.queue_counts(id);
            let session = inner.session(id)?;
            Ok(SessionStatistics {
                session: id,
                counters: session.stats.counters(),
                rates: session.stats.rates(now),
                outstanding,
                unacknowledged,
            })
        })
    }

    /// Blocks until every session's queue is empty or `timeout` elapses.
    /// A zero timeout waits forever. On timeout the remaining records are
    /// dropped, reported as lost, and `WouldBlock` is returned.
    pub fn drain_queue(&self, timeout: Duration) -> ExporterResult<()> {
        self.drain(None, timeout, false)
    }

    fn drain(&self, scope: Option<SessionId>, timeout: Duration, stop_on_stall: bool) -> ExporterResult<()> {
        let started = Instant::now();
        loop {
            let (state, poll) = self.locked(|inner| (inner.drain_state(scope), inner.config.drain_poll_interval));
            match state {
                DrainState::Drained => return Ok(()),
                DrainState::Stalled if stop_on_stall => return Err(ExporterError::WouldBlock),
                _ => {}
            }
            if !timeout.is_zero() && started.elapsed() >= timeout {
                self.locked(|inner| inner.drain_cleanup(scope));
                return Err(ExporterError::WouldBlock);
            }
            std::thread::sleep(poll);
        }
    }
}

impl ExporterInner {
    fn stopped_session_mut(&mut self, id: SessionId) -> ExporterResult<&mut Session> {
        let session = self.session_mut(id)?;
        if session.running {
            return Err(ExporterError::SessionRunning(id));
        }
        Ok(session)
    }

    fn scope_ids(&self, scope: Option<SessionId>) -> Vec<SessionId> {
        match scope {
            Some(id) => vec![id],
            None => self.sessions.keys().copied().collect(),
        }
    }

    fn drain_state(&self, scope: Option<SessionId>) -> DrainState {
        let mut state = DrainState::Drained;
        for id in self.scope_ids(scope) {
            let (outstanding, unacknowledged) = self.queue_counts(id);
            if outstanding + unacknowledged == 0 {
                continue;
            }
            let carried = self
                .sessions
                .get(&id)
                .is_some_and(|s| s.transmitting_cs().is_some());
            if carried {
                return DrainState::Pending;
            }
            state = DrainState::Stalled;
        }
        state
    }

    fn drain_cleanup(&mut self, scope: Option<SessionId>) {
        for id in self.scope_ids(scope) {
            let lost = self.queue.cleanup(id) as u64;
            let Some(transmitting) = self.sessions.get(&id).map(Session::transmitting_cs) else {
                continue;
            };
            let window_timer = transmitting
                .and_then(|cs| self.collector_sessions.get_mut(&cs))
                .and_then(|cs| cs.window_timer.take());
            self.cancel_timer(window_timer);
            if lost == 0 {
                continue;
            }
            if let Some(session) = self.sessions.get_mut(&id) {
                session.stats.counters.lost += lost;
            }
            self.emit(
                Event::new(EventKind::RecordLost, Severity::Warning)
                    .with_session(id)
                    .with_lost(lost),
            );
        }
    }

    fn delete_session(&mut self, id: SessionId) -> ExporterResult<()> {
        let session = self.session(id)?;
        if session.running {
            return Err(ExporterError::SessionRunning(id));
        }
        let links = session.collector_sessions.clone();
        if let Some(active) = links
            .iter()
            .find(|cs| self.collector_sessions.get(cs).is_some_and(|c| c.state == CSState::Active))
        {
            return Err(ExporterError::CollectorSessionActive {
                session: id,
                collector: self.cs_collector_name(*active),
            });
        }
        for cs in links {
            self.unlink_collector_session(cs);
        }
        let dropped = self.queue.remove_session(id);
        self.sessions.remove(&id);
        debug!(session = id.0, dropped, "session deleted");
        Ok(())
    }

    /// Detaches a collector session from its session and collector.
    pub(crate) fn unlink_collector_session(&mut self, cs: CollectorSessionId) {
        let Some(removed) = self.collector_sessions.remove(&cs) else {
            return;
        };
        self.cancel_timer(removed.window_timer);
        if let Some(session) = self.sessions.get_mut(&removed.session) {
            session.unlink_collector_session(cs);
        }
        if let Some(collector) = self.collectors.get_mut(&removed.collector) {
            collector.collector_sessions.retain(|id| *id != cs);
        }
    }

    fn start_session(&mut self, id: SessionId) -> ExporterResult<()> {
        if !self.started {
            return Err(ExporterError::NotRunning);
        }
        let session = self.session(id)?;
        // A stopping session still holds its collector until SESSION_STOP is out.
        if session.transmitting_cs().is_some() {
            return Err(ExporterError::SessionLogicallyRunning(id));
        }
        if session.contexts.is_empty() {
            self.new_context(id)?;
        }
        self.session_mut(id)?.running = true;
        self.select_collector(id);
        Ok(())
    }

    /// First stop phase. Returns true if an active collector must be drained.
    fn begin_stop(&mut self, id: SessionId) -> ExporterResult<bool> {
        let session = self.session_mut(id)?;
        if !session.running && session.transmitting_cs().is_none() {
            return Err(ExporterError::SessionNotRunning(id));
        }
        session.running = false;
        if let Some(cs) = session.active_cs.take() {
            session.stopping_cs = Some(cs);
        }
        Ok(session.stopping_cs.is_some())
    }

    fn finish_stop_session(&mut self, id: SessionId, reason: SessionStopReason) -> StopOutcome {
        let cs = self
            .sessions
            .get_mut(&id)
            .and_then(|s| s.stopping_cs.take());
        self.finish_stop(id, cs, reason)
    }

    /// Stops a session without draining.
    pub(crate) fn stop_session_now(&mut self, id: SessionId, reason: SessionStopReason) -> StopOutcome {
        let Some(session) = self.sessions.get_mut(&id) else {
            return StopOutcome::LogicallyStopped;
        };
        session.running = false;
        let active = session.active_cs.take();
        let stopping = session.stopping_cs.take();
        self.finish_stop(id, active.or(stopping), reason)
    }

    /// Second stop phase: notifies the collector that was receiving records.
    fn finish_stop(
        &mut self,
        id: SessionId,
        cs: Option<CollectorSessionId>,
        reason: SessionStopReason,
    ) -> StopOutcome {
        let Some(cs_id) = cs else {
            info!(session = id.0, "session stopped with no active collector");
            return StopOutcome::LogicallyStopped;
        };
        let handle = self.cs_handle(cs_id);
        if let Some(handle) = handle {
            if let Err(e) = self
                .protocol
                .send_session_stop(self.transport.as_ref(), handle, id, reason)
            {
                warn!(session = id.0, %handle, error = %e, "failed to send SESSION_STOP");
            }
        }
        let window_timer = self.collector_sessions.get_mut(&cs_id).and_then(|cs| {
            if handle.is_some() {
                cs.state = CSState::Ready;
                cs.window_timer.take()
            } else {
                cs.disconnect()
            }
        });
        self.cancel_timer(window_timer);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.resync_needed = true;
        }
        let rewound = self.queue.rewind(id);
        if rewound > 0 {
            debug!(session = id.0, rewound, "unacknowledged records rewound on stop");
        }

        let collector = self.cs_collector_name(cs_id);
        if let Some(cs) = self.collector_sessions.get_mut(&cs_id) {
            cs.last_event = Some(EventKind::ActiveCollectorChanged);
        }
        self.emit(
            Event::new(EventKind::ActiveCollectorChanged, Severity::Info)
                .with_session(id)
                .with_collector(collector),
        );
        StopOutcome::Stopped
    }

    /// Allocates a configuration id, freezes the templates into a new work
    /// context and drops contexts no queued record refers to.
    pub(crate) fn new_context(&mut self, id: SessionId) -> ExporterResult<u16> {
        let config_ids = &self.config_ids;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ExporterError::SessionNotFound(id))?;
        let (config_id, previous) = session
            .contexts
            .allocate_id(|| config_ids.initial_configuration_id(id));
        let snapshots = session.templates.values().map(|t| t.snapshot()).collect();
        session
            .contexts
            .push(TransmissionContext::new(config_id, snapshots));
        self.queue.context_changed(id, config_id);
        if let Some(previous) = previous {
            self.config_ids.configuration_id_changed(id, previous, config_id);
        }
        self.collect_contexts(id);
        debug!(session = id.0, config_id, "new transmission context");
        Ok(config_id)
    }

    /// Drops contexts no longer referenced by queued records.
    pub(crate) fn collect_contexts(&mut self, id: SessionId) {
        let queue = &self.queue;
        if let Some(session) = self.sessions.get_mut(&id) {
            let dropped = session
                .contexts
                .collect_garbage(|config_id| queue.holds_context(id, config_id));
            if !dropped.is_empty() {
                debug!(session = id.0, ?dropped, "released transmission contexts");
            }
        }
    }

    pub(crate) fn session_info(&self, id: SessionId) -> ExporterResult<SessionInfo> {
        let session = self.session(id)?;
        let active_collector = session
            .active_cs
            .map(|cs| self.cs_collector_name(cs));
        Ok(SessionInfo {
            id,
            name: session.name.clone(),
            description: session.description.clone(),
            document_id: session.document_id,
            negotiable: session.negotiable,
            running: session.running,
            dsn: session.dsn,
            resync_needed: session.resync_needed,
            active_collector,
            active_collector_session: session.active_cs,
            templates: session.templates.keys().copied().collect(),
            configuration_ids: session.contexts.ids(),
            collector_sessions: session.collector_sessions.clone(),
        })
    }
}
