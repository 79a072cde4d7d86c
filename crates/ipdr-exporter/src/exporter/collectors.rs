//! Collectors and collector-session associations.

use tracing::{debug, info};

use super::{audit_result, Exporter, ExporterInner};
use crate::audit::{AuditCategory, AuditObject, AuditRecord};
use crate::collector::{Collector, CollectorConfig, CollectorInfo, Direction};
use crate::collector_session::{AssocOutcome, CSState, CollectorSession, CollectorSessionInfo};
use crate::error::{ExporterError, ExporterResult};
use crate::types::{CollectorId, CollectorSessionId, ConnectionId, SessionId};

impl Exporter {
    /// Registers a collector and its connection pool. When the exporter is
    /// running the pool is dialed at once.
    pub fn create_collector(&self, config: CollectorConfig) -> ExporterResult<CollectorId> {
        let result = self.locked(|inner| inner.create_collector(&config));
        audit_result(
            AuditRecord::new(AuditCategory::Provisioning, "create_collector")
                .object(AuditObject::Collector)
                .id(config.name.clone())
                .details(serde_json::json!({
                    "address": config.socket_addr().to_string(),
                    "connections": config.num_of_connections,
                })),
            &result,
        );
        result
    }

    /// Creates a collector if needed and associates it with a session.
    pub fn add_collector(
        &self,
        session: SessionId,
        config: CollectorConfig,
        priority: u32,
    ) -> ExporterResult<AssocOutcome> {
        self.locked(|inner| {
            inner.session(session)?;
            if inner.collector_by_name(&config.name).is_err() {
                inner.create_collector(&config)?;
            }
            inner.assoc(session, &config.name, priority)
        })
    }

    /// Binds a collector to a session with the given priority (lower is
    /// preferred). An existing binding only has its priority updated.
    pub fn assoc_collector_session(
        &self,
        session: SessionId,
        collector: &str,
        priority: u32,
    ) -> ExporterResult<AssocOutcome> {
        let result = self.locked(|inner| inner.assoc(session, collector, priority));
        audit_result(
            AuditRecord::new(AuditCategory::Provisioning, "assoc_collector_session")
                .object(AuditObject::Association)
                .id(format!("{}:{}", session, collector))
                .details(serde_json::json!({ "priority": priority })),
            &result,
        );
        result
    }

    /// Unbinds a collector from a stopped session.
    pub fn remove_collector_from_session(&self, session: SessionId, collector: &str) -> ExporterResult<()> {
        let result = self.locked(|inner| {
            let collector_id = inner.collector_by_name(collector)?;
            let cs = inner.find_cs(session, collector_id).ok_or_else(|| {
                ExporterError::CollectorSessionNotFound {
                    session,
                    collector: collector.to_string(),
                }
            })?;
            inner.check_removable(cs)?;
            inner.unlink_collector_session(cs);
            Ok(())
        });
        audit_result(
            AuditRecord::new(AuditCategory::Decommission, "remove_collector_from_session")
                .object(AuditObject::Association)
                .id(format!("{}:{}", session, collector)),
            &result,
        );
        result
    }

    /// Removes a collector, its associations and its connections.
    pub fn remove_collector(&self, name: &str) -> ExporterResult<()> {
        let result = self.locked(|inner| inner.remove_collector(name));
        audit_result(
            AuditRecord::new(AuditCategory::Decommission, "remove_collector")
                .object(AuditObject::Collector)
                .id(name),
            &result,
        );
        result
    }

    pub fn get_collector(&self, name: &str) -> ExporterResult<CollectorInfo> {
        self.locked(|inner| {
            let id = inner.collector_by_name(name)?;
            inner
                .collector_info(id)
                .ok_or_else(|| ExporterError::CollectorNotFound(name.to_string()))
        })
    }

    pub fn list_collectors(&self) -> Vec<CollectorInfo> {
        self.locked(|inner| {
            let ids: Vec<CollectorId> = inner.collectors.keys().copied().collect();
            ids.into_iter().filter_map(|id| inner.collector_info(id)).collect()
        })
    }

    /// Statistics and state of one session/collector binding.
    pub fn get_collector_statistics_and_state(
        &self,
        session: SessionId,
        collector: &str,
    ) -> ExporterResult<CollectorSessionInfo> {
        self.locked(|inner| {
            let collector_id = inner.collector_by_name(collector)?;
            let cs = inner.find_cs(session, collector_id).ok_or_else(|| {
                ExporterError::CollectorSessionNotFound {
                    session,
                    collector: collector.to_string(),
                }
            })?;
            inner
                .cs_info(cs)
                .ok_or_else(|| ExporterError::CollectorSessionNotFound {
                    session,
                    collector: collector.to_string(),
                })
        })
    }
}

impl ExporterInner {
    pub(crate) fn create_collector(&mut self, config: &CollectorConfig) -> ExporterResult<CollectorId> {
        if config.name.is_empty() {
            return Err(ExporterError::InvalidArgument("collector name is empty".into()));
        }
        let clash = self.collectors.values().any(|c| {
            !c.is_dummy && (c.name == config.name || c.socket_addr() == config.socket_addr())
        });
        if clash {
            return Err(ExporterError::CollectorExists(config.name.clone()));
        }

        let id = CollectorId(self.collector_ids.next());
        let mut collector = Collector::configured(id, config);
        for _ in 0..config.num_of_connections {
            let conn = ConnectionId(self.connection_ids.next());
            collector.add_connection(conn, Direction::Outbound);
        }
        self.collectors.insert(id, collector);
        info!(collector = %config.name, addr = %config.socket_addr(), "collector created");

        if self.started {
            self.dial_collector(id);
        }
        Ok(id)
    }

    pub(crate) fn assoc(
        &mut self,
        session: SessionId,
        collector: &str,
        priority: u32,
    ) -> ExporterResult<AssocOutcome> {
        self.session(session)?;
        let collector_id = self.collector_by_name(collector)?;

        if let Some(existing) = self.find_cs(session, collector_id) {
            if let Some(cs) = self.collector_sessions.get_mut(&existing) {
                cs.priority = priority;
            }
            debug!(session = session.0, collector, priority, "collector session reprioritized");
            return Ok(AssocOutcome::Reassociated(existing));
        }

        let id = CollectorSessionId(self.cs_ids.next());
        let mut cs = CollectorSession::new(id, session, collector_id, priority);
        if let Some(conn) = self
            .collectors
            .get(&collector_id)
            .and_then(Collector::ready_connection)
        {
            cs.state = CSState::Ready;
            cs.connection = Some(conn.id);
        }
        cs.stats.roll(self.now());
        self.collector_sessions.insert(id, cs);
        if let Some(c) = self.collectors.get_mut(&collector_id) {
            c.collector_sessions.push(id);
        }
        self.session_mut(session)?.collector_sessions.push(id);

        self.select_collector(session);
        Ok(AssocOutcome::Associated(id))
    }

    /// A binding can be removed only while its session is stopped and it is
    /// not active.
    fn check_removable(&self, cs: CollectorSessionId) -> ExporterResult<()> {
        let Some(binding) = self.collector_sessions.get(&cs) else {
            return Ok(());
        };
        let collector = self.collector_name(binding.collector);
        if binding.state == CSState::Active {
            return Err(ExporterError::CollectorSessionActive {
                session: binding.session,
                collector,
            });
        }
        if self
            .sessions
            .get(&binding.session)
            .is_some_and(|s| s.running)
        {
            return Err(ExporterError::SessionRunning(binding.session));
        }
        Ok(())
    }

    fn remove_collector(&mut self, name: &str) -> ExporterResult<()> {
        let id = self.collector_by_name(name)?;
        let bindings = self
            .collectors
            .get(&id)
            .map(|c| c.collector_sessions.clone())
            .unwrap_or_default();
        for cs in &bindings {
            self.check_removable(*cs)?;
        }
        for cs in bindings {
            self.unlink_collector_session(cs);
        }
        self.drop_collector(id);
        info!(collector = name, "collector removed");
        Ok(())
    }

    /// Closes every connection of a collector and forgets it.
    pub(crate) fn drop_collector(&mut self, id: CollectorId) {
        let Some(mut collector) = self.collectors.remove(&id) else {
            return;
        };
        for conn in collector.connections.values_mut() {
            if let Some(handle) = conn.handle {
                self.transport.close(handle);
                self.handles.remove(&handle);
            }
            for timer in conn.reset() {
                self.timers.cancel(timer);
            }
        }
    }

    pub(crate) fn collector_info(&self, id: CollectorId) -> Option<CollectorInfo> {
        let collector = self.collectors.get(&id)?;
        let sessions = collector
            .collector_sessions
            .iter()
            .filter_map(|cs| self.collector_sessions.get(cs))
            .map(|cs| cs.session)
            .collect();
        Some(collector.info(sessions))
    }

    pub(crate) fn cs_info(&self, id: CollectorSessionId) -> Option<CollectorSessionInfo> {
        let now = self.now();
        let cs = self.collector_sessions.get(&id)?;
        Some(CollectorSessionInfo {
            id,
            session: cs.session,
            collector: self.collector_name(cs.collector),
            priority: cs.priority,
            state: cs.state,
            counters: cs.stats.counters(),
            rates: cs.stats.rates(now),
            last_event: cs.last_event,
        })
    }
}
