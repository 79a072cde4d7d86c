//! Connection and collector-session state driven by the transport and the
//! protocol.
//!
//! A collector session becomes `Ready` once its collector finished the
//! handshake on some connection, and `Active` when selected for its running
//! session. Losing the connection drops every binding it carried back to
//! `Disconnected` (or onto another ready connection of the same collector),
//! rewinds unacknowledged records and reruns selection.

use std::net::SocketAddr;

use ipdr_wire::SessionStopReason;
use tracing::{debug, info, warn};

use super::{Exporter, ExporterInner};
use crate::collector::{Collector, ConnectionState, Direction};
use crate::collector_session::CSState;
use crate::error::{ExporterError, ExporterResult};
use crate::events::{DisconnectReason, ErrorReason, Event, EventKind, Severity};
use crate::protocol::{Candidate, SessionStartInfo};
use crate::timer::{TimerId, TimerKind};
use crate::types::{CollectorId, CollectorSessionId, ConnectionId, SessionId, TransportHandle};

impl Exporter {
    /// Registers a connection a collector opened to us. Unknown peers get a
    /// dummy collector. Returns the name of the owning collector.
    pub fn inbound_connection(&self, handle: TransportHandle, peer: SocketAddr) -> ExporterResult<String> {
        self.locked(|inner| inner.inbound_connection(handle, peer))
    }

    /// An outbound connection attempt succeeded.
    pub fn connection_established(&self, handle: TransportHandle, peer: Option<SocketAddr>) -> ExporterResult<()> {
        self.locked(|inner| inner.connection_established(handle, peer))
    }

    /// An outbound connection attempt failed. The slot is retried on the
    /// next autoconnect tick.
    pub fn connection_failed(&self, handle: TransportHandle) -> ExporterResult<()> {
        self.locked(|inner| inner.connection_failed(handle))
    }

    /// The transport reports that a connection went away.
    pub fn connection_closed(&self, handle: TransportHandle, reason: DisconnectReason) -> ExporterResult<()> {
        self.locked(|inner| {
            inner.connection_of(handle)?;
            inner.handle_disconnect(handle, reason);
            Ok(())
        })
    }

    /// Closes a connection from our side.
    pub fn close_connection(&self, handle: TransportHandle, reason: DisconnectReason) -> ExporterResult<()> {
        self.locked(|inner| {
            inner.connection_of(handle)?;
            inner.transport.close(handle);
            inner.handle_disconnect(handle, reason);
            Ok(())
        })
    }

    /// Any message arrived on `handle`; refreshes its inbound keep-alive.
    pub fn message_received(&self, handle: TransportHandle) -> ExporterResult<()> {
        self.locked(|inner| inner.message_received(handle))
    }

    /// The handshake on `handle` finished. Every binding of the collector
    /// that was disconnected becomes ready. Returns how many did.
    pub fn connection_ready(&self, handle: TransportHandle) -> ExporterResult<usize> {
        self.locked(|inner| inner.connection_ready(handle))
    }

    /// The collector on `handle` is ready to receive `session`.
    pub fn collector_session_ready(&self, handle: TransportHandle, session: SessionId) -> ExporterResult<()> {
        self.locked(|inner| {
            let cs = inner.binding_for(handle, session)?;
            let (_, conn_id) = inner.connection_of(handle)?;
            if let Some(binding) = inner.collector_sessions.get_mut(&cs) {
                if binding.state == CSState::Disconnected {
                    binding.state = CSState::Ready;
                    binding.connection = Some(conn_id);
                }
            }
            inner.select_collector(session);
            Ok(())
        })
    }

    /// The collector on `handle` stopped receiving `session`.
    pub fn flow_stopped(&self, handle: TransportHandle, session: SessionId) -> ExporterResult<()> {
        self.locked(|inner| {
            let cs = inner.binding_for(handle, session)?;
            if let Some(session) = inner.cs_lost(cs, DisconnectReason::Tcp, false) {
                inner.select_collector(session);
            }
            Ok(())
        })
    }

    /// Makes the collector on `handle` the active one for `session`, handing
    /// over from the current active collector if there is one.
    pub fn activate_collector_session(&self, handle: TransportHandle, session: SessionId) -> ExporterResult<()> {
        self.locked(|inner| inner.activate_collector_session(handle, session))
    }
}

impl ExporterInner {
    /// The binding between the collector owning `handle` and `session`.
    /// Raises an error event when either side is unknown.
    fn binding_for(&mut self, handle: TransportHandle, session: SessionId) -> ExporterResult<CollectorSessionId> {
        let (collector_id, _) = self.connection_of(handle)?;
        let collector = self.collector_name(collector_id);
        if !self.sessions.contains_key(&session) {
            self.emit(
                Event::new(EventKind::Error(ErrorReason::UnknownSession), Severity::Error)
                    .with_session(session)
                    .with_collector(collector),
            );
            return Err(ExporterError::SessionNotFound(session));
        }
        match self.find_cs(session, collector_id) {
            Some(cs) => Ok(cs),
            None => {
                self.emit(
                    Event::new(EventKind::Error(ErrorReason::UnknownServer), Severity::Error)
                        .with_session(session)
                        .with_collector(collector.clone()),
                );
                Err(ExporterError::CollectorSessionNotFound { session, collector })
            }
        }
    }

    /// Dials every configured collector's idle pooled connections.
    pub(crate) fn autoconnect_pass(&mut self) {
        let ids: Vec<CollectorId> = self
            .collectors
            .values()
            .filter(|c| !c.is_dummy)
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.dial_collector(id);
        }
    }

    pub(crate) fn dial_collector(&mut self, id: CollectorId) {
        if !self.started {
            return;
        }
        let Some(collector) = self.collectors.get_mut(&id) else {
            return;
        };
        let addr = collector.socket_addr();
        let idle: Vec<ConnectionId> = collector
            .connections
            .values()
            .filter(|c| c.autoconnect && c.state == ConnectionState::Disconnected)
            .map(|c| c.id)
            .collect();
        for conn_id in idle {
            match self.transport.dial(addr) {
                Ok(handle) => {
                    if let Some(conn) = collector.connection_mut(conn_id) {
                        conn.state = ConnectionState::Connecting;
                        conn.direction = Direction::Outbound;
                        conn.handle = Some(handle);
                        conn.peer = Some(addr);
                    }
                    self.handles.insert(handle, (id, conn_id));
                    debug!(collector = %collector.name, %addr, %handle, "dialing collector");
                }
                Err(e) => {
                    warn!(collector = %collector.name, %addr, error = %e, "dial failed; retrying on next autoconnect");
                    break;
                }
            }
        }
    }

    fn inbound_connection(&mut self, handle: TransportHandle, peer: SocketAddr) -> ExporterResult<String> {
        if self.handles.contains_key(&handle) {
            return Err(ExporterError::InvalidArgument(format!(
                "{} is already registered",
                handle
            )));
        }
        let known = self
            .collectors
            .values()
            .find(|c| !c.is_dummy && c.matches_peer(peer))
            .or_else(|| {
                self.collectors
                    .values()
                    .find(|c| c.is_dummy && c.matches_peer(peer))
            })
            .map(|c| c.id);
        let collector_id = match known {
            Some(id) => id,
            None => {
                let id = CollectorId(self.collector_ids.next());
                let dummy = Collector::dummy(id, peer);
                info!(collector = %dummy.name, %peer, "connection from unknown peer; created dummy collector");
                self.collectors.insert(id, dummy);
                id
            }
        };

        let Some(collector) = self.collectors.get_mut(&collector_id) else {
            return Err(ExporterError::ConnectionNotFound(handle));
        };
        let conn_id = match collector.idle_slot() {
            Some(slot) => slot,
            None => {
                let id = ConnectionId(self.connection_ids.next());
                collector.add_connection(id, Direction::Inbound).id
            }
        };
        if let Some(conn) = collector.connection_mut(conn_id) {
            conn.state = ConnectionState::Connected;
            conn.direction = Direction::Inbound;
            conn.handle = Some(handle);
            conn.peer = Some(peer);
            conn.handshake_complete = false;
        }
        let name = collector.name.clone();
        self.handles.insert(handle, (collector_id, conn_id));
        self.emit(
            Event::new(EventKind::ServerConnected, Severity::Info)
                .with_collector(name.clone())
                .with_peer(Some(peer)),
        );
        self.arm_keep_alive(collector_id, conn_id);
        Ok(name)
    }

    fn connection_established(&mut self, handle: TransportHandle, peer: Option<SocketAddr>) -> ExporterResult<()> {
        let (collector_id, conn_id) = self.connection_of(handle)?;
        let Some(collector) = self.collectors.get_mut(&collector_id) else {
            return Err(ExporterError::ConnectionNotFound(handle));
        };
        let fallback = collector.socket_addr();
        let name = collector.name.clone();
        let Some(conn) = collector.connection_mut(conn_id) else {
            return Err(ExporterError::ConnectionNotFound(handle));
        };
        conn.state = ConnectionState::Connected;
        conn.peer = peer.or(Some(fallback));
        let peer = conn.peer;

        self.emit(
            Event::new(EventKind::ServerConnected, Severity::Info)
                .with_collector(name)
                .with_peer(peer),
        );
        self.arm_keep_alive(collector_id, conn_id);

        if let Err(e) = self
            .protocol
            .on_connected(self.transport.as_ref(), handle, &self.config)
        {
            warn!(%handle, error = %e, "connection handshake failed");
            self.transport.close(handle);
            self.handle_disconnect(handle, DisconnectReason::Tcp);
            return Err(e.into());
        }
        Ok(())
    }

    fn connection_failed(&mut self, handle: TransportHandle) -> ExporterResult<()> {
        let (collector_id, conn_id) = self
            .handles
            .remove(&handle)
            .ok_or(ExporterError::ConnectionNotFound(handle))?;
        let Some(collector) = self.collectors.get_mut(&collector_id) else {
            return Ok(());
        };
        let name = collector.name.clone();
        let addr = collector.socket_addr();
        let timers = collector
            .connection_mut(conn_id)
            .map(|conn| conn.reset())
            .unwrap_or_default();
        for timer in timers {
            self.timers.cancel(timer);
        }
        self.emit(
            Event::new(EventKind::ServerDisconnected(DisconnectReason::Initial), Severity::Info)
                .with_collector(name)
                .with_peer(Some(addr)),
        );
        Ok(())
    }

    /// Tears down the connection behind `handle`: every binding it carried
    /// is dropped, affected sessions fail over, and the connection slot is
    /// released for autoconnect.
    pub(crate) fn handle_disconnect(&mut self, handle: TransportHandle, reason: DisconnectReason) {
        let Some((collector_id, conn_id)) = self.handles.remove(&handle) else {
            return;
        };
        let Some(collector) = self.collectors.get_mut(&collector_id) else {
            return;
        };
        let over_pool = collector.connections.len() > collector.num_of_connections as usize;
        let Some(conn) = collector.connection_mut(conn_id) else {
            return;
        };
        let was_connected = conn.is_connected();
        let peer = conn.peer;
        let timers = conn.reset();
        let inbound = conn.direction == Direction::Inbound;
        if inbound && !over_pool {
            // Hand the pooled slot back to autoconnect.
            conn.direction = Direction::Outbound;
        }
        if inbound && over_pool {
            collector.connections.remove(&conn_id);
        }
        let name = collector.name.clone();
        let remove_dummy = collector.is_dummy
            && collector.connections.is_empty()
            && collector.collector_sessions.is_empty();
        let bindings = collector.collector_sessions.clone();

        for timer in timers {
            self.timers.cancel(timer);
        }
        let affected: Vec<CollectorSessionId> = bindings
            .into_iter()
            .filter(|cs| {
                self.collector_sessions
                    .get(cs)
                    .is_some_and(|b| b.connection == Some(conn_id))
            })
            .collect();
        let mut failover = Vec::new();
        for cs in affected {
            if let Some(session) = self.cs_lost(cs, reason, true) {
                failover.push(session);
            }
        }

        if was_connected {
            let severity = match reason {
                DisconnectReason::Stop => Severity::Info,
                _ => Severity::Warning,
            };
            self.emit(
                Event::new(EventKind::ServerDisconnected(reason), severity)
                    .with_collector(name.clone())
                    .with_peer(peer),
            );
        }
        if remove_dummy {
            self.collectors.remove(&collector_id);
            debug!(collector = %name, "dummy collector released");
        }
        for session in failover {
            self.select_collector(session);
        }
        if was_connected && !self.collectors.values().any(Collector::has_connected) {
            self.emit(Event::new(EventKind::AllServersDisconnected, Severity::Warning));
        }
    }

    pub(crate) fn close_all_connections(&mut self, reason: DisconnectReason) {
        let handles: Vec<TransportHandle> = self.handles.keys().copied().collect();
        for handle in handles {
            self.transport.close(handle);
            self.handle_disconnect(handle, reason);
        }
    }

    /// Drops a binding off its connection. With `rebind`, a binding whose
    /// collector has another ready connection moves onto it. Returns the
    /// session if the binding was carrying its records, so the caller can
    /// rerun selection.
    fn cs_lost(&mut self, cs_id: CollectorSessionId, reason: DisconnectReason, rebind: bool) -> Option<SessionId> {
        let cs = self.collector_sessions.get_mut(&cs_id)?;
        let window_timer = cs.disconnect();
        cs.last_event = Some(EventKind::ServerDisconnected(reason));
        let session_id = cs.session;
        if rebind {
            if let Some(conn) = self
                .collectors
                .get(&cs.collector)
                .and_then(Collector::ready_connection)
            {
                cs.state = CSState::Ready;
                cs.connection = Some(conn.id);
            }
        }
        self.cancel_timer(window_timer);

        let session = self.sessions.get_mut(&session_id)?;
        if session.transmitting_cs() != Some(cs_id) {
            return None;
        }
        if session.active_cs == Some(cs_id) {
            session.active_cs = None;
        } else {
            session.stopping_cs = None;
        }
        session.resync_needed = true;
        let rewound = self.queue.rewind(session_id);
        let collector = self.cs_collector_name(cs_id);
        debug!(session = session_id.0, %collector, rewound, "active collector lost");
        self.emit(
            Event::new(EventKind::ActiveCollectorChanged, Severity::Warning)
                .with_session(session_id)
                .with_collector(collector),
        );
        Some(session_id)
    }

    /// Activates the preferred ready collector of a running session that has
    /// none.
    pub(crate) fn select_collector(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        if !session.running || session.transmitting_cs().is_some() {
            return;
        }
        let candidates: Vec<Candidate> = session
            .collector_sessions
            .iter()
            .filter_map(|cs| self.collector_sessions.get(cs))
            .filter(|cs| cs.state == CSState::Ready)
            .map(|cs| Candidate {
                id: cs.id,
                collector: self.collector_name(cs.collector),
                priority: cs.priority,
                state: cs.state,
            })
            .collect();
        if candidates.is_empty() {
            debug!(session = id.0, "no ready collector");
            return;
        }
        let Some(chosen) = self.protocol.select_collector(id, &candidates) else {
            return;
        };
        if let Err(e) = self.activate(chosen) {
            warn!(session = id.0, error = %e, "collector activation failed");
        }
    }

    /// Sends SESSION_START on a ready binding and makes it active.
    fn activate(&mut self, cs_id: CollectorSessionId) -> ExporterResult<()> {
        let cs = self
            .collector_sessions
            .get(&cs_id)
            .ok_or_else(|| ExporterError::InvalidArgument(format!("unknown {}", cs_id)))?;
        let session_id = cs.session;
        let collector = self.collector_name(cs.collector);
        let not_ready = || ExporterError::CollectorSessionNotReady {
            session: session_id,
            collector: collector.clone(),
        };
        if cs.state != CSState::Ready {
            return Err(not_ready());
        }
        let handle = self.cs_handle(cs_id).ok_or_else(not_ready)?;
        let session = self.session(session_id)?;
        if !session.running {
            return Err(ExporterError::SessionNotRunning(session_id));
        }

        let (outstanding, unacknowledged) = self.queue_counts(session_id);
        let start = SessionStartInfo {
            session: session_id,
            first_dsn: session
                .dsn
                .saturating_sub((outstanding + unacknowledged) as u64),
            dropped: session.stats.counters.lost,
            primary: true,
            window_size: self.config.window_size,
            window_timeout: self.config.window_timeout,
            document_id: session.document_id,
            boot_time: self.boot_time,
        };
        if let Err(e) = self
            .protocol
            .send_session_start(self.transport.as_ref(), handle, &start)
        {
            self.transport.close(handle);
            self.handle_disconnect(handle, DisconnectReason::Tcp);
            return Err(e.into());
        }

        if let Some(cs) = self.collector_sessions.get_mut(&cs_id) {
            cs.state = CSState::Active;
            cs.last_event = Some(EventKind::ActiveCollectorChanged);
        }
        self.session_mut(session_id)?.active_cs = Some(cs_id);
        let peer = self.cs_peer(cs_id);
        info!(session = session_id.0, %collector, first_dsn = start.first_dsn, "collector activated");
        self.emit(
            Event::new(EventKind::ActiveCollectorChanged, Severity::Info)
                .with_session(session_id)
                .with_collector(collector)
                .with_peer(peer),
        );
        self.send_outstanding_data(session_id);
        Ok(())
    }

    fn activate_collector_session(&mut self, handle: TransportHandle, id: SessionId) -> ExporterResult<()> {
        let cs_id = self.binding_for(handle, id)?;
        let (_, conn_id) = self.connection_of(handle)?;
        let session = self.session(id)?;
        if session.active_cs == Some(cs_id) {
            return Ok(());
        }
        if !session.running {
            return Err(ExporterError::SessionNotRunning(id));
        }
        if let Some(previous) = session.active_cs {
            self.hand_over(id, previous);
        }
        if let Some(cs) = self.collector_sessions.get_mut(&cs_id) {
            cs.state = CSState::Ready;
            cs.connection = Some(conn_id);
        }
        self.activate(cs_id)
    }

    /// Tells the current active collector to stop and rewinds the queue so
    /// unacknowledged records go to the next one.
    fn hand_over(&mut self, id: SessionId, previous: CollectorSessionId) {
        let handle = self.cs_handle(previous);
        if let Some(handle) = handle {
            if let Err(e) = self.protocol.send_session_stop(
                self.transport.as_ref(),
                handle,
                id,
                SessionStopReason::HandingOver,
            ) {
                warn!(session = id.0, %handle, error = %e, "failed to send SESSION_STOP on handover");
            }
        }
        let window_timer = self
            .collector_sessions
            .get_mut(&previous)
            .and_then(|cs| {
                if handle.is_some() {
                    cs.state = CSState::Ready;
                    cs.window_timer.take()
                } else {
                    cs.disconnect()
                }
            });
        self.cancel_timer(window_timer);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.active_cs = None;
        }
        let rewound = self.queue.rewind(id);
        debug!(session = id.0, rewound, "handing over active collector");
    }

    fn connection_ready(&mut self, handle: TransportHandle) -> ExporterResult<usize> {
        let (collector_id, conn_id) = self.connection_of(handle)?;
        let Some(collector) = self.collectors.get_mut(&collector_id) else {
            return Err(ExporterError::ConnectionNotFound(handle));
        };
        if let Some(conn) = collector.connection_mut(conn_id) {
            conn.handshake_complete = true;
        }
        let bindings = collector.collector_sessions.clone();

        let mut readied = 0;
        let mut sessions = Vec::new();
        for cs_id in bindings {
            if let Some(cs) = self.collector_sessions.get_mut(&cs_id) {
                if cs.state == CSState::Disconnected {
                    cs.state = CSState::Ready;
                    cs.connection = Some(conn_id);
                    readied += 1;
                }
                sessions.push(cs.session);
            }
        }
        for session in sessions {
            self.select_collector(session);
        }
        Ok(readied)
    }

    fn message_received(&mut self, handle: TransportHandle) -> ExporterResult<()> {
        let (collector_id, conn_id) = self.connection_of(handle)?;
        let interval = self.config.keep_alive_interval;
        if interval.is_zero() {
            return Ok(());
        }
        let deadline = self.now() + interval * 2;
        let Some(conn) = self
            .collectors
            .get_mut(&collector_id)
            .and_then(|c| c.connection_mut(conn_id))
        else {
            return Ok(());
        };
        if let Some(timer) = conn.keep_alive_in.take() {
            self.timers.cancel(timer);
        }
        conn.keep_alive_in = Some(
            self.timers
                .schedule(TimerKind::KeepAliveIn(collector_id, conn_id), deadline),
        );
        Ok(())
    }

    /// Starts the outbound keep-alive and the inbound liveness timer.
    fn arm_keep_alive(&mut self, collector_id: CollectorId, conn_id: ConnectionId) {
        let interval = self.config.keep_alive_interval;
        if interval.is_zero() {
            return;
        }
        let now = self.now();
        let Some(conn) = self
            .collectors
            .get_mut(&collector_id)
            .and_then(|c| c.connection_mut(conn_id))
        else {
            return;
        };
        for timer in conn.keep_alive_out.take().into_iter().chain(conn.keep_alive_in.take()) {
            self.timers.cancel(timer);
        }
        conn.keep_alive_out = Some(self.timers.schedule_periodic(
            TimerKind::KeepAliveOut(collector_id, conn_id),
            now,
            interval,
        ));
        conn.keep_alive_in = Some(
            self.timers
                .schedule(TimerKind::KeepAliveIn(collector_id, conn_id), now + interval * 2),
        );
    }

    /// Re-arms keep-alives of every live connection with the current interval.
    pub(crate) fn rearm_keep_alives(&mut self) {
        let live: Vec<(CollectorId, ConnectionId)> = self.handles.values().copied().collect();
        for (collector_id, conn_id) in live {
            let connected = self
                .collectors
                .get(&collector_id)
                .and_then(|c| c.connection(conn_id))
                .is_some_and(|c| c.is_connected());
            if !connected {
                continue;
            }
            if self.config.keep_alive_interval.is_zero() {
                if let Some(conn) = self
                    .collectors
                    .get_mut(&collector_id)
                    .and_then(|c| c.connection_mut(conn_id))
                {
                    for timer in conn.keep_alive_out.take().into_iter().chain(conn.keep_alive_in.take()) {
                        self.timers.cancel(timer);
                    }
                }
            } else {
                self.arm_keep_alive(collector_id, conn_id);
            }
        }
    }

    pub(crate) fn keep_alive_due(&mut self, collector_id: CollectorId, conn_id: ConnectionId) {
        let Some(handle) = self
            .collectors
            .get(&collector_id)
            .and_then(|c| c.connection(conn_id))
            .filter(|c| c.is_connected())
            .and_then(|c| c.handle)
        else {
            return;
        };
        if let Err(e) = self
            .protocol
            .send_keep_alive(self.transport.as_ref(), handle)
        {
            warn!(%handle, error = %e, "keep-alive failed; closing connection");
            self.transport.close(handle);
            self.handle_disconnect(handle, DisconnectReason::Tcp);
        }
    }

    pub(crate) fn keep_alive_expired(&mut self, collector_id: CollectorId, conn_id: ConnectionId, timer: TimerId) {
        let Some(conn) = self
            .collectors
            .get_mut(&collector_id)
            .and_then(|c| c.connection_mut(conn_id))
        else {
            return;
        };
        if conn.keep_alive_in != Some(timer) {
            return;
        }
        conn.keep_alive_in = None;
        let Some(handle) = conn.handle else {
            return;
        };
        warn!(%handle, collector = %collector_id, "nothing heard from collector; closing connection");
        self.transport.close(handle);
        self.handle_disconnect(handle, DisconnectReason::Timeout);
    }
}
