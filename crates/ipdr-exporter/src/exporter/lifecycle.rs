//! Start, stop, reconfiguration and timer processing.

use std::time::Instant;

use chrono::{DateTime, Utc};
use ipdr_wire::SessionStopReason;
use tracing::{debug, info};

use super::{audit_result, Exporter, ExporterInner};
use crate::audit::{AuditCategory, AuditObject, AuditRecord};
use crate::config::{ExporterConfig, ParameterStore};
use crate::error::{ExporterError, ExporterResult};
use crate::events::DisconnectReason;
use crate::timer::{TimerId, TimerKind};
use crate::transport::TransportError;
use crate::types::SessionId;

impl Exporter {
    /// Starts listening, arms the periodic timers, dials every configured
    /// collector and starts every session.
    pub fn start(&self) -> ExporterResult<()> {
        let result = self.locked(ExporterInner::start);
        audit_result(AuditRecord::new(AuditCategory::Lifecycle, "start"), &result);
        result
    }

    /// Stops every session, closes every connection and cancels all timers.
    /// Queued records are kept.
    pub fn stop(&self) -> ExporterResult<()> {
        let result = self.locked(ExporterInner::stop);
        audit_result(AuditRecord::new(AuditCategory::Lifecycle, "stop"), &result);
        result
    }

    /// Stops the exporter if needed and releases every object it owns.
    pub fn delete(self) -> ExporterResult<()> {
        let result = self.locked(|inner| {
            if inner.started {
                inner.stop()?;
            }
            let sessions: Vec<SessionId> = inner.sessions.keys().copied().collect();
            for id in sessions {
                inner.queue.remove_session(id);
            }
            inner.collector_sessions.clear();
            inner.sessions.clear();
            inner.collectors.clear();
            inner.handles.clear();
            inner.timers.clear();
            Ok(())
        });
        audit_result(AuditRecord::new(AuditCategory::Lifecycle, "delete"), &result);
        result
    }

    pub fn is_started(&self) -> bool {
        self.locked(|inner| inner.started)
    }

    pub fn boot_time(&self) -> DateTime<Utc> {
        self.locked(|inner| inner.boot_time)
    }

    /// Merges `params` into the parameter store and applies the result.
    ///
    /// A change to the listen address, listen port or discovery port restarts
    /// the listener and every running session; anything else is applied in
    /// place.
    pub fn reconfigure(&self, params: &ParameterStore) -> ExporterResult<()> {
        let result = self.locked(|inner| inner.reconfigure(params));
        let keys: Vec<&str> = params.explicit().map(|(k, _)| k).collect();
        audit_result(
            AuditRecord::new(AuditCategory::Configuration, "reconfigure")
                .details(serde_json::json!({ "parameters": keys })),
            &result,
        );
        result
    }

    /// Effective value of a parameter.
    pub fn get_parameter(&self, key: &str) -> Option<String> {
        self.locked(|inner| inner.params.get(key).map(str::to_string))
    }

    /// Sets a parameter. The value takes effect at the next `start` or
    /// `reconfigure`.
    pub fn set_parameter(&self, key: &str, value: &str) -> ExporterResult<()> {
        let result = self.locked(|inner| {
            let mut next = inner.params.clone();
            next.set(key, value)?;
            ExporterConfig::from_store(&next)?;
            inner.params = next;
            Ok(())
        });
        audit_result(
            AuditRecord::new(AuditCategory::Configuration, "set_parameter")
                .object(AuditObject::Parameter)
                .id(key)
                .details(serde_json::json!({ "value": value })),
            &result,
        );
        result
    }

    /// Fires every expired timer. Returns how many fired.
    pub fn process_timers(&self) -> usize {
        self.locked(|inner| {
            let now = inner.now();
            let fired = inner.timers.expire(now);
            let count = fired.len();
            for (id, kind) in fired {
                inner.on_timer(id, kind);
            }
            count
        })
    }

    /// Earliest pending timer deadline.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.locked(|inner| inner.timers.next_deadline())
    }
}

impl ExporterInner {
    pub(crate) fn start(&mut self) -> ExporterResult<()> {
        if self.started {
            return Err(ExporterError::AlreadyRunning);
        }
        self.config = ExporterConfig::from_store(&self.params)?;
        self.queue
            .initialize(self.config.queue_capacity, self.config.window_size);
        self.start_listening()?;

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in &ids {
            self.session_mut(*id)?.reset_templates();
            self.new_context(*id)?;
        }

        self.started = true;
        self.install_periodic_timers();
        self.roll_statistics();
        self.autoconnect_pass();

        for id in ids {
            self.session_mut(id)?.running = true;
            self.select_collector(id);
        }

        info!(
            listen = %self.config.listen_addr(),
            sessions = self.sessions.len(),
            collectors = self.collectors.len(),
            "exporter started"
        );
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> ExporterResult<()> {
        if !self.started {
            return Err(ExporterError::NotRunning);
        }
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.stop_session_now(id, SessionStopReason::EndOfData);
        }
        self.close_all_connections(DisconnectReason::Stop);
        self.timers.clear();
        self.periodic.clear();
        self.transport.stop_listening();
        self.started = false;
        info!("exporter stopped");
        Ok(())
    }

    fn start_listening(&mut self) -> ExporterResult<()> {
        let addr = self.config.listen_addr();
        match self.transport.listen(addr) {
            Ok(()) => {
                info!(%addr, "listening for collectors");
                Ok(())
            }
            Err(TransportError::Unsupported(_)) => {
                info!("transport does not accept inbound connections");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// (Re)arms the statistics and autoconnect timers from the current
    /// configuration. A zero interval disables the timer.
    pub(crate) fn install_periodic_timers(&mut self) {
        for id in std::mem::take(&mut self.periodic) {
            self.timers.cancel(id);
        }
        let now = self.now();
        let schedule = [
            (TimerKind::StatisticsReport, self.config.statistics_interval),
            (TimerKind::Autoconnect, self.config.autoconnect_interval),
        ];
        for (kind, period) in schedule {
            if !period.is_zero() {
                let id = self.timers.schedule_periodic(kind, now, period);
                self.periodic.push(id);
            }
        }
    }

    fn roll_statistics(&mut self) {
        let now = self.now();
        for session in self.sessions.values_mut() {
            session.stats.roll(now);
        }
        for cs in self.collector_sessions.values_mut() {
            cs.stats.roll(now);
        }
    }

    pub(crate) fn reconfigure(&mut self, params: &ParameterStore) -> ExporterResult<()> {
        let mut merged = self.params.clone();
        merged.merge(params);
        let next = ExporterConfig::from_store(&merged)?;
        self.params = merged;
        let previous = std::mem::replace(&mut self.config, next);
        if !self.started {
            return Ok(());
        }
        if previous.requires_restart(&self.config) {
            self.hard_restart()
        } else {
            self.apply_in_place();
            Ok(())
        }
    }

    fn hard_restart(&mut self) -> ExporterResult<()> {
        info!(listen = %self.config.listen_addr(), "restarting listener and sessions");
        let running: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.running)
            .map(|s| s.id)
            .collect();
        for id in &running {
            self.stop_session_now(*id, SessionStopReason::Deactivated);
        }
        self.close_all_connections(DisconnectReason::Stop);
        self.transport.stop_listening();
        self.queue
            .initialize(self.config.queue_capacity, self.config.window_size);
        self.install_periodic_timers();
        let listening = self.start_listening();
        self.autoconnect_pass();
        for id in running {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.running = true;
            }
            self.select_collector(id);
        }
        listening
    }

    fn apply_in_place(&mut self) {
        self.queue
            .initialize(self.config.queue_capacity, self.config.window_size);
        self.install_periodic_timers();
        self.rearm_keep_alives();
        // A larger window may let more records out right away.
        let running: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.transmitting_cs().is_some())
            .map(|s| s.id)
            .collect();
        for id in running {
            self.send_outstanding_data(id);
        }
        debug!(window_size = self.config.window_size, "parameters applied in place");
    }

    fn on_timer(&mut self, id: TimerId, kind: TimerKind) {
        match kind {
            TimerKind::WindowAck(cs) => self.window_expired(cs, id),
            TimerKind::StatisticsReport => self.report_statistics(),
            TimerKind::Autoconnect => self.autoconnect_pass(),
            TimerKind::KeepAliveOut(collector, conn) => self.keep_alive_due(collector, conn),
            TimerKind::KeepAliveIn(collector, conn) => self.keep_alive_expired(collector, conn, id),
        }
    }

    fn report_statistics(&mut self) {
        let now = self.now();
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            let (outstanding, unacknowledged) = self.queue_counts(id);
            if let Some(session) = self.sessions.get_mut(&id) {
                let rates = session.stats.roll(now);
                let counters = session.stats.counters();
                info!(
                    session = id.0,
                    transmitted = counters.transmitted,
                    acknowledged = counters.acknowledged,
                    enqueued = counters.enqueued,
                    lost = counters.lost,
                    tx_rate = rates.transmitted,
                    ack_rate = rates.acknowledged,
                    outstanding,
                    unacknowledged,
                    "session statistics"
                );
            }
        }
        let collectors = &self.collectors;
        for cs in self.collector_sessions.values_mut() {
            let rates = cs.stats.roll(now);
            let counters = cs.stats.counters();
            debug!(
                session = cs.session.0,
                collector = collectors.get(&cs.collector).map(|c| c.name.as_str()).unwrap_or(""),
                state = %cs.state,
                transmitted = counters.transmitted,
                acknowledged = counters.acknowledged,
                tx_rate = rates.transmitted,
                "collector session statistics"
            );
        }
    }
}
