//! Record path: build, enqueue, transmit, acknowledge.

use ipdr_wire::{data_flags, DataMessage, Message, HEADER_LEN, MAX_MESSAGE_LEN};
use tracing::{debug, trace, warn};

use super::{Exporter, ExporterInner};
use crate::error::{ExporterError, ExporterResult};
use crate::events::{DisconnectReason, ErrorReason, Event, EventKind, Severity};
use crate::queue::{QueueError, QueuedRecord};
use crate::template::Record;
use crate::timer::{TimerId, TimerKind};
use crate::types::{CollectorSessionId, SessionId, TransportHandle};

impl Exporter {
    /// Encodes a record against the session's current context, queues it
    /// and transmits as far as the window allows. Returns the assigned DSN.
    pub fn send_data(&self, session: SessionId, template_id: u16, record: &Record) -> ExporterResult<u64> {
        self.locked(|inner| inner.send_data(session, template_id, record))
    }

    /// Sends a record to every running session whose current context holds
    /// `template_id`. Every session is attempted; the first failure is
    /// returned.
    pub fn send_data_all(&self, template_id: u16, record: &Record) -> ExporterResult<Vec<(SessionId, u64)>> {
        self.locked(|inner| {
            let targets: Vec<SessionId> = inner
                .sessions
                .values()
                .filter(|s| s.running)
                .filter(|s| {
                    s.contexts
                        .work()
                        .is_some_and(|ctx| ctx.template(template_id).is_some())
                })
                .map(|s| s.id)
                .collect();
            if targets.is_empty() {
                return Err(ExporterError::TemplateNotFoundAnywhere(template_id));
            }
            let mut sent = Vec::with_capacity(targets.len());
            let mut first_error = None;
            for id in targets {
                match inner.send_data(id, template_id, record) {
                    Ok(dsn) => sent.push((id, dsn)),
                    Err(e) => {
                        warn!(session = id.0, template_id, error = %e, "send to session failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(sent),
            }
        })
    }

    /// Handles a DATA_ACK. Returns how many records it acknowledged.
    pub fn data_acknowledged(
        &self,
        handle: TransportHandle,
        session: SessionId,
        config_id: u16,
        dsn: u64,
    ) -> ExporterResult<usize> {
        self.locked(|inner| inner.data_acknowledged(handle, session, config_id, dsn))
    }
}

impl ExporterInner {
    fn send_data(&mut self, id: SessionId, template_id: u16, record: &Record) -> ExporterResult<u64> {
        let session = self.session(id)?;
        if !session.running {
            return Err(ExporterError::SessionNotRunning(id));
        }
        let dsn = session.dsn;
        let message = self.build_record(id, template_id, dsn, record)?;

        match self.queue.enqueue(id, message) {
            Ok(()) => {}
            Err(QueueError::Full { capacity, .. }) => {
                let (outstanding, unacknowledged) = self.queue_counts(id);
                self.session_mut(id)?.stats.counters.lost += 1;
                self.emit(
                    Event::new(EventKind::RecordLost, Severity::Warning)
                        .with_session(id)
                        .with_counts(outstanding, unacknowledged)
                        .with_lost(1),
                );
                debug!(session = id.0, capacity, "record rejected by full queue");
                return Err(ExporterError::QueueFull(id));
            }
            Err(e) => return Err(e.into()),
        }

        let session = self.session_mut(id)?;
        session.dsn += 1;
        session.stats.counters.enqueued += 1;
        let active = session.active_cs;
        if let Some(cs) = active.and_then(|cs| self.collector_sessions.get_mut(&cs)) {
            cs.stats.counters.enqueued += 1;
        }
        self.send_outstanding_data(id);
        Ok(dsn)
    }

    /// Encodes `record` with the template of the session's work context.
    fn build_record(
        &self,
        id: SessionId,
        template_id: u16,
        dsn: u64,
        record: &Record,
    ) -> ExporterResult<DataMessage> {
        let session = self.session(id)?;
        let context = session
            .contexts
            .work()
            .ok_or(ExporterError::TemplateNotFound {
                session: id,
                template_id,
            })?;
        let snapshot = context
            .template(template_id)
            .ok_or(ExporterError::TemplateNotFound {
                session: id,
                template_id,
            })?;
        let template = session
            .templates
            .get(&template_id)
            .ok_or(ExporterError::TemplateNotFound {
                session: id,
                template_id,
            })?;
        let payload = template.encoder.encode(snapshot, record)?;
        let frame_len = HEADER_LEN + DataMessage::FIXED_LEN + payload.len();
        if frame_len > MAX_MESSAGE_LEN {
            return Err(ExporterError::InvalidArgument(format!(
                "encoded record of {} bytes exceeds the maximum message length",
                frame_len
            )));
        }
        Ok(DataMessage {
            template_id,
            config_id: context.config_id(),
            flags: 0,
            sequence: dsn,
            payload,
        })
    }

    /// The collector session records go to, and its live transport handle.
    fn prepare_to_send(&self, id: SessionId) -> ExporterResult<(CollectorSessionId, TransportHandle)> {
        let cs = self
            .session(id)?
            .transmitting_cs()
            .ok_or(ExporterError::NoActiveCollector(id))?;
        let handle = self.cs_handle(cs).ok_or_else(|| {
            ExporterError::Communication(format!("no live connection for session {}", id))
        })?;
        Ok((cs, handle))
    }

    /// Transmits queued records until the queue or the window is exhausted.
    /// Re-entrant calls return at once.
    pub(crate) fn send_outstanding_data(&mut self, id: SessionId) {
        match self.sessions.get_mut(&id) {
            Some(session) if !session.sending_data => session.sending_data = true,
            _ => return,
        }

        let mut failure = None;
        while let Ok((cs, handle)) = self.prepare_to_send(id) {
            let Some(record) = self.queue.next_to_transmit(id) else {
                break;
            };
            if let Err(e) = self.send_record(id, cs, handle, record) {
                failure = Some((handle, e));
                break;
            }
        }

        if let Some(session) = self.sessions.get_mut(&id) {
            session.sending_data = false;
        }
        if let Some((handle, e)) = failure {
            warn!(session = id.0, %handle, error = %e, "transmission failed; closing connection");
            self.transport.close(handle);
            self.handle_disconnect(handle, DisconnectReason::Tcp);
        }
    }

    fn send_record(
        &mut self,
        id: SessionId,
        cs: CollectorSessionId,
        handle: TransportHandle,
        record: QueuedRecord,
    ) -> ExporterResult<()> {
        let dsn = record.dsn();
        let mut message = record.message;
        if record.transmitted_before {
            message.flags |= data_flags::DUPLICATE;
        }
        let frame = Message::Data(message).encode(id.0)?;
        self.arm_window_timer(cs);
        self.transport.send(handle, frame)?;

        self.queue.mark_transmitted(id, dsn);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.stats.counters.transmitted += 1;
            session.resync_needed = false;
        }
        if let Some(cs) = self.collector_sessions.get_mut(&cs) {
            cs.stats.counters.transmitted += 1;
        }
        trace!(session = id.0, dsn, duplicate = record.transmitted_before, "record transmitted");
        Ok(())
    }

    /// Starts the acknowledgment timer unless one is already pending.
    fn arm_window_timer(&mut self, cs_id: CollectorSessionId) {
        let deadline = self.now() + self.config.window_timeout;
        let Some(cs) = self.collector_sessions.get_mut(&cs_id) else {
            return;
        };
        if cs.window_timer.is_some_and(|t| self.timers.is_pending(t)) {
            return;
        }
        cs.window_timer = Some(self.timers.schedule(TimerKind::WindowAck(cs_id), deadline));
    }

    /// No acknowledgment arrived within the window timeout. The collector is
    /// reported but the connection is left alone.
    pub(crate) fn window_expired(&mut self, cs_id: CollectorSessionId, timer: TimerId) {
        let Some(cs) = self.collector_sessions.get_mut(&cs_id) else {
            return;
        };
        if cs.window_timer != Some(timer) {
            return;
        }
        cs.window_timer = None;
        let kind = EventKind::ServerDisconnected(DisconnectReason::Timeout);
        cs.last_event = Some(kind);
        let session = cs.session;

        let (outstanding, unacknowledged) = self.queue_counts(session);
        let collector = self.cs_collector_name(cs_id);
        let peer = self.cs_peer(cs_id);
        self.emit(
            Event::new(kind, Severity::Warning)
                .with_session(session)
                .with_collector(collector)
                .with_peer(peer)
                .with_counts(outstanding, unacknowledged),
        );
    }

    fn data_acknowledged(
        &mut self,
        handle: TransportHandle,
        id: SessionId,
        config_id: u16,
        dsn: u64,
    ) -> ExporterResult<usize> {
        let (collector, _) = self.connection_of(handle)?;
        if !self.sessions.contains_key(&id) {
            let collector = self.collector_name(collector);
            self.emit(
                Event::new(EventKind::Error(ErrorReason::UnknownSession), Severity::Error)
                    .with_session(id)
                    .with_collector(collector),
            );
            return Err(ExporterError::SessionNotFound(id));
        }
        let Some(cs_id) = self.session(id)?.transmitting_cs() else {
            debug!(session = id.0, dsn, "acknowledgment with no active collector");
            return Ok(0);
        };
        if self.cs_handle(cs_id) != Some(handle) {
            debug!(session = id.0, dsn, %handle, "acknowledgment from an inactive collector");
            return Ok(0);
        }

        let acked = self.queue.acknowledge(id, config_id, dsn);
        let (outstanding, unacknowledged) = self.queue_counts(id);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.stats.counters.acknowledged += acked as u64;
        }
        let window_timer = self.collector_sessions.get_mut(&cs_id).and_then(|cs| {
            cs.stats.counters.acknowledged += acked as u64;
            cs.window_timer.take()
        });
        self.cancel_timer(window_timer);
        if unacknowledged > 0 {
            self.arm_window_timer(cs_id);
        }
        self.collect_contexts(id);

        if acked > 0 && outstanding == 0 && unacknowledged == 0 {
            let collector = self.cs_collector_name(cs_id);
            self.emit(
                Event::new(EventKind::QueueEmpty, Severity::Info)
                    .with_session(id)
                    .with_collector(collector),
            );
        }
        self.send_outstanding_data(id);
        Ok(acked)
    }
}
