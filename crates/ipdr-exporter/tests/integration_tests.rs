//! Integration tests for the exporter core
//!
//! Drives the exporter through its public API with an in-memory transport
//! and a manual clock: connections are "established" by calling the
//! protocol-facing operations with the handles the transport hands out.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipdr_exporter::config::{
    DRAIN_POLL_INTERVAL, EXPORTER_PORT, KEEP_ALIVE_INTERVAL, QUEUE_CAPACITY, WINDOW_SIZE, WINDOW_TIMEOUT,
};
use ipdr_exporter::{
    AssocOutcome, CSState, CollectorConfig, ConfigurationIdCallbacks, DisconnectReason, EventKind,
    EventLog, Exporter, ExporterError, FieldValue, Key, KeyNegotiation, KeyType, ManualClock,
    MemoryTransport, ParameterStore, Record, SessionId, Severity, StopOutcome, TemplateConfig,
    TransportHandle,
};
use ipdr_wire::{Message, SessionStopReason};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

const S1: SessionId = SessionId(1);
const USAGE: u16 = 1;

struct Harness {
    exporter: Exporter,
    transport: Arc<MemoryTransport>,
    clock: Arc<ManualClock>,
    events: Arc<EventLog>,
}

impl Harness {
    fn new(params: &[(&str, &str)]) -> Self {
        Self::with_builder(params, |b| b)
    }

    fn with_builder(
        params: &[(&str, &str)],
        customize: impl FnOnce(ipdr_exporter::ExporterBuilder) -> ipdr_exporter::ExporterBuilder,
    ) -> Self {
        let mut store = ParameterStore::new();
        for (key, value) in params {
            store.set(key, *value).unwrap();
        }
        let transport = Arc::new(MemoryTransport::new());
        let clock = Arc::new(ManualClock::new());
        let builder = Exporter::builder(transport.clone())
            .parameters(store)
            .clock(clock.clone());
        let exporter = customize(builder).build().unwrap();
        let events = Arc::new(EventLog::new());
        exporter.add_event_handler(events.clone());
        Self {
            exporter,
            transport,
            clock,
            events,
        }
    }

    /// Session 1 with a two-field usage template.
    fn with_session(self) -> Self {
        self.exporter.create_session(S1, "usage", "subscriber usage").unwrap();
        let template = TemplateConfig::new(USAGE, "urn:test:usage", "Usage")
            .with_key(Key::new(1, "subscriberId", KeyType::String))
            .with_key(Key::new(2, "octets", KeyType::UnsignedLong));
        self.exporter.create_template(S1, template, None).unwrap();
        self
    }

    fn with_collector(self, name: &str, last_octet: u8, priority: u32) -> Self {
        self.exporter.create_collector(collector(name, last_octet)).unwrap();
        self.exporter.assoc_collector_session(S1, name, priority).unwrap();
        self
    }

    /// Completes the dial and the handshake of the collector at
    /// `10.0.0.<last_octet>`.
    fn bring_up(&self, last_octet: u8) -> TransportHandle {
        let handle = self
            .transport
            .last_dial_to(addr(last_octet))
            .expect("collector was not dialed");
        self.exporter.connection_established(handle, None).unwrap();
        self.exporter.connection_ready(handle).unwrap();
        handle
    }

    fn send(&self, octets: u64) -> u64 {
        self.exporter.send_data(S1, USAGE, &usage(octets)).unwrap()
    }

    fn data_sequences(&self, handle: TransportHandle) -> Vec<(u64, bool)> {
        self.transport
            .sent_messages(handle)
            .into_iter()
            .filter_map(|(_, m)| match m {
                Message::Data(data) => Some((data.sequence, data.is_duplicate())),
                _ => None,
            })
            .collect()
    }

    fn cs_state(&self, collector: &str) -> CSState {
        self.exporter
            .get_collector_statistics_and_state(S1, collector)
            .unwrap()
            .state
    }
}

fn addr(last_octet: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 4737)
}

fn collector(name: &str, last_octet: u8) -> CollectorConfig {
    CollectorConfig::new(name, addr(last_octet).ip(), 4737)
}

fn usage(octets: u64) -> Record {
    Record::new()
        .with(1, FieldValue::Str("cm-0001".into()))
        .with(2, FieldValue::UInt(octets))
}

#[test]
fn test_records_flow_to_active_collector_and_are_acknowledged() {
    let h = Harness::new(&[]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.bring_up(1);

    let info = h.exporter.get_session(S1).unwrap();
    assert!(info.running);
    assert_eq!(info.active_collector.as_deref(), Some("A"));
    assert_eq!(h.cs_state("A"), CSState::Active);

    assert_eq!(h.send(100), 0);
    assert_eq!(h.send(200), 1);

    let messages = h.transport.sent_messages(handle);
    assert!(matches!(messages[0].1, Message::Connect(_)));
    match &messages[1].1 {
        Message::SessionStart(start) => {
            assert_eq!(start.first_record_sequence, 0);
            assert_eq!(start.document_id, *info.document_id.as_bytes());
        }
        other => panic!("expected SESSION_START, got {:?}", other),
    }
    assert_eq!(messages[1].0.session_id, 1);
    assert_eq!(h.data_sequences(handle), vec![(0, false), (1, false)]);

    let config_id = info.configuration_ids[0];
    assert_eq!(h.exporter.data_acknowledged(handle, S1, config_id, 1).unwrap(), 2);

    let stats = h.exporter.get_session_statistics(S1).unwrap();
    assert_eq!(stats.counters.transmitted, 2);
    assert_eq!(stats.counters.acknowledged, 2);
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.unacknowledged, 0);
    assert_eq!(h.events.count(EventKind::QueueEmpty), 1);
    assert_eq!(h.events.count(EventKind::ServerConnected), 1);
}

#[test]
fn test_window_limits_records_in_flight() {
    let h = Harness::new(&[(WINDOW_SIZE, "2")]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.bring_up(1);

    let dsns: Vec<u64> = (0..5).map(|i| h.send(i)).collect();
    assert_eq!(dsns, vec![0, 1, 2, 3, 4]);
    assert_eq!(h.data_sequences(handle), vec![(0, false), (1, false)]);

    let config_id = h.exporter.get_session(S1).unwrap().configuration_ids[0];
    h.exporter.data_acknowledged(handle, S1, config_id, 1).unwrap();
    assert_eq!(
        h.data_sequences(handle),
        vec![(0, false), (1, false), (2, false), (3, false)]
    );

    let stats = h.exporter.get_session_statistics(S1).unwrap();
    assert_eq!(stats.outstanding, 1);
    assert_eq!(stats.unacknowledged, 2);
}

#[test]
fn test_window_timeout_reports_collector_without_closing() {
    let h = Harness::new(&[(WINDOW_TIMEOUT, "1000")])
        .with_session()
        .with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.bring_up(1);
    h.send(1);

    h.clock.advance(Duration::from_millis(500));
    h.exporter.process_timers();
    assert_eq!(h.events.count(EventKind::ServerDisconnected(DisconnectReason::Timeout)), 0);

    // A second unacknowledged record does not push the deadline back.
    h.send(2);
    h.clock.advance(Duration::from_millis(600));
    assert!(h.exporter.process_timers() >= 1);

    let timeouts: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::ServerDisconnected(DisconnectReason::Timeout))
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].severity, Severity::Warning);
    assert_eq!(timeouts[0].collector.as_deref(), Some("A"));
    assert_eq!(timeouts[0].unacknowledged, 2);

    assert!(h.transport.is_open(handle));
    assert_eq!(h.cs_state("A"), CSState::Active);
}

#[test]
fn test_reassociation_updates_priority() {
    let h = Harness::new(&[]).with_session();
    h.exporter.create_collector(collector("A", 1)).unwrap();

    let first = h.exporter.assoc_collector_session(S1, "A", 5).unwrap();
    let second = h.exporter.assoc_collector_session(S1, "A", 2).unwrap();
    assert!(matches!(first, AssocOutcome::Associated(_)));
    assert_eq!(second, AssocOutcome::Reassociated(first.id()));

    let info = h.exporter.get_collector_statistics_and_state(S1, "A").unwrap();
    assert_eq!(info.priority, 2);
    assert_eq!(info.state, CSState::Disconnected);
    assert_eq!(h.exporter.get_collector("A").unwrap().sessions, vec![S1]);
}

#[test]
fn test_start_without_reachable_collector_stops_logically() {
    let h = Harness::new(&[]).with_session();
    h.exporter.create_collector(collector("C1", 1)).unwrap();
    assert!(matches!(
        h.exporter.assoc_collector_session(S1, "C1", 10).unwrap(),
        AssocOutcome::Associated(_)
    ));
    assert!(matches!(
        h.exporter.assoc_collector_session(S1, "C1", 20).unwrap(),
        AssocOutcome::Reassociated(_)
    ));
    assert_eq!(h.exporter.get_session(S1).unwrap().collector_sessions.len(), 1);

    h.exporter.start().unwrap();
    assert!(h.exporter.get_session(S1).unwrap().running);
    assert!(h.exporter.get_session(S1).unwrap().active_collector.is_none());
    assert!(matches!(h.exporter.start(), Err(ExporterError::AlreadyRunning)));
    assert!(matches!(
        h.exporter.set_document_id(S1, uuid::Uuid::new_v4()),
        Err(ExporterError::SessionRunning(_))
    ));

    assert_eq!(
        h.exporter
            .stop_session(S1, SessionStopReason::EndOfData, Duration::ZERO)
            .unwrap(),
        StopOutcome::LogicallyStopped
    );
    let info = h.exporter.get_session(S1).unwrap();
    assert!(!info.running);
    assert!(info.active_collector.is_none());
    assert_eq!(
        h.exporter.get_collector_statistics_and_state(S1, "C1").unwrap().priority,
        20
    );
}

#[test]
fn test_duplicate_collector_is_rejected() {
    let h = Harness::new(&[]);
    h.exporter.create_collector(collector("A", 1)).unwrap();
    assert!(matches!(
        h.exporter.create_collector(collector("A", 2)),
        Err(ExporterError::CollectorExists(_))
    ));
    assert!(matches!(
        h.exporter.create_collector(collector("B", 1)),
        Err(ExporterError::CollectorExists(_))
    ));
}

#[test]
fn test_active_binding_cannot_be_removed() {
    let h = Harness::new(&[]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    h.bring_up(1);

    assert!(matches!(
        h.exporter.remove_collector_from_session(S1, "A"),
        Err(ExporterError::CollectorSessionActive { .. })
    ));
    assert!(matches!(
        h.exporter.remove_collector("A"),
        Err(ExporterError::CollectorSessionActive { .. })
    ));
    assert!(matches!(
        h.exporter.delete_session(S1),
        Err(ExporterError::SessionRunning(_))
    ));

    h.exporter.stop().unwrap();
    h.exporter.remove_collector_from_session(S1, "A").unwrap();
    h.exporter.remove_collector("A").unwrap();
    h.exporter.delete_session(S1).unwrap();
    assert!(h.exporter.list_collectors().is_empty());
    assert!(h.exporter.list_sessions().is_empty());
}

#[test]
fn test_send_requires_running_session() {
    let h = Harness::new(&[]).with_session();
    assert!(matches!(
        h.exporter.send_data(S1, USAGE, &usage(1)),
        Err(ExporterError::SessionNotRunning(_))
    ));
    assert!(matches!(
        h.exporter.start_session(S1),
        Err(ExporterError::NotRunning)
    ));

    h.exporter.start().unwrap();
    assert!(matches!(
        h.exporter.send_data(S1, 99, &usage(1)),
        Err(ExporterError::TemplateNotFound { .. })
    ));
    assert!(matches!(
        h.exporter.send_data(S1, USAGE, &Record::new()),
        Err(ExporterError::Encode(_))
    ));
    // Rejected records do not consume sequence numbers.
    assert_eq!(h.send(1), 0);
}

#[test]
fn test_full_queue_rejects_new_records() {
    let h = Harness::new(&[(QUEUE_CAPACITY, "2")]).with_session();
    h.exporter.start().unwrap();
    h.send(1);
    h.send(2);

    assert!(matches!(
        h.exporter.send_data(S1, USAGE, &usage(3)),
        Err(ExporterError::QueueFull(_))
    ));
    assert_eq!(h.events.count(EventKind::RecordLost), 1);
    let stats = h.exporter.get_session_statistics(S1).unwrap();
    assert_eq!(stats.counters.lost, 1);
    assert_eq!(stats.outstanding, 2);
    assert_eq!(h.exporter.get_session(S1).unwrap().dsn, 2);
}

struct RecordingIds {
    changes: Mutex<Vec<(u16, u16)>>,
}

impl ConfigurationIdCallbacks for RecordingIds {
    fn initial_configuration_id(&self, _session: SessionId) -> Option<u16> {
        Some(10)
    }

    fn configuration_id_changed(&self, _session: SessionId, previous: u16, current: u16) {
        self.changes.lock().push((previous, current));
    }
}

#[test]
fn test_configuration_ids_follow_callbacks() {
    let ids = Arc::new(RecordingIds {
        changes: Mutex::new(Vec::new()),
    });
    let callbacks = ids.clone();
    let h = Harness::with_builder(&[], move |b| b.configuration_ids(callbacks)).with_session();

    assert_eq!(h.exporter.apply_templates(S1).unwrap(), 10);
    assert_eq!(h.exporter.apply_templates(S1).unwrap(), 11);
    assert_eq!(*ids.changes.lock(), vec![(10, 11)]);

    assert!(h
        .exporter
        .negotiate_templates(S1, &[KeyNegotiation { template_id: USAGE, key_id: 2, enabled: false }])
        .is_err());
    h.exporter.set_negotiable(S1, true).unwrap();
    assert!(matches!(
        h.exporter
            .negotiate_templates(S1, &[KeyNegotiation { template_id: USAGE, key_id: 9, enabled: false }]),
        Err(ExporterError::KeyNotFound { .. })
    ));
    assert_eq!(
        h.exporter
            .negotiate_templates(S1, &[KeyNegotiation { template_id: USAGE, key_id: 2, enabled: false }])
            .unwrap(),
        12
    );
    assert_eq!(*ids.changes.lock(), vec![(10, 11), (11, 12)]);
}

#[test]
fn test_drain_completes_when_acks_arrive() {
    let h = Harness::new(&[(DRAIN_POLL_INTERVAL, "5")])
        .with_session()
        .with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.bring_up(1);
    for i in 0..3 {
        h.send(i);
    }
    let config_id = h.exporter.get_session(S1).unwrap().configuration_ids[0];

    let acker = h.exporter.clone();
    let ack = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        acker.data_acknowledged(handle, S1, config_id, 2).unwrap()
    });

    // A zero timeout waits for as long as it takes.
    h.exporter.drain_queue(Duration::ZERO).unwrap();
    assert_eq!(ack.join().unwrap(), 3);
    assert_eq!(h.events.count(EventKind::RecordLost), 0);
}

#[test]
fn test_drain_timeout_drops_remaining_records() {
    let h = Harness::new(&[(DRAIN_POLL_INTERVAL, "5")]).with_session();
    h.exporter.start().unwrap();
    h.send(1);
    h.send(2);

    assert!(matches!(
        h.exporter.drain_queue(Duration::from_millis(50)),
        Err(ExporterError::WouldBlock)
    ));

    let lost: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::RecordLost)
        .collect();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].lost, 2);
    let stats = h.exporter.get_session_statistics(S1).unwrap();
    assert_eq!(stats.counters.lost, 2);
    assert_eq!(stats.outstanding, 0);
}

#[test]
fn test_failover_to_next_collector_retransmits() {
    let h = Harness::new(&[])
        .with_session()
        .with_collector("A", 1, 1)
        .with_collector("B", 2, 2);
    h.exporter.start().unwrap();
    let a = h.bring_up(1);
    let b = h.bring_up(2);
    assert_eq!(h.cs_state("A"), CSState::Active);
    assert_eq!(h.cs_state("B"), CSState::Ready);

    for i in 0..3 {
        h.send(i);
    }
    assert_eq!(h.data_sequences(a).len(), 3);

    h.exporter.connection_closed(a, DisconnectReason::Tcp).unwrap();

    let info = h.exporter.get_session(S1).unwrap();
    assert_eq!(info.active_collector.as_deref(), Some("B"));
    assert_eq!(h.cs_state("A"), CSState::Disconnected);
    let start = h
        .transport
        .sent_messages(b)
        .into_iter()
        .find_map(|(_, m)| match m {
            Message::SessionStart(start) => Some(start),
            _ => None,
        })
        .expect("no SESSION_START on the backup collector");
    assert_eq!(start.first_record_sequence, 0);
    assert_eq!(h.data_sequences(b), vec![(0, true), (1, true), (2, true)]);

    assert_eq!(h.events.count(EventKind::ServerDisconnected(DisconnectReason::Tcp)), 1);
    assert_eq!(h.events.count(EventKind::ActiveCollectorChanged), 3);
    assert_eq!(h.events.count(EventKind::AllServersDisconnected), 0);

    let config_id = info.configuration_ids[0];
    assert_eq!(h.exporter.data_acknowledged(b, S1, config_id, 2).unwrap(), 3);
    // Stale acknowledgments from the lost collector are refused.
    assert!(h.exporter.data_acknowledged(a, S1, config_id, 2).is_err());

    h.exporter.connection_closed(b, DisconnectReason::Tcp).unwrap();
    assert_eq!(h.events.count(EventKind::AllServersDisconnected), 1);
    assert!(h.exporter.get_session(S1).unwrap().active_collector.is_none());
}

#[test]
fn test_failed_dial_reports_initial_disconnect() {
    let h = Harness::new(&[]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.transport.last_dial_to(addr(1)).unwrap();

    h.exporter.connection_failed(handle).unwrap();
    let events = h.events.events();
    let initial = events
        .iter()
        .find(|e| e.kind == EventKind::ServerDisconnected(DisconnectReason::Initial))
        .expect("no initial disconnect event");
    assert_eq!(initial.severity, Severity::Info);
    assert_eq!(h.events.count(EventKind::AllServersDisconnected), 0);

    // The slot is dialed again on the next autoconnect tick.
    h.clock.advance(Duration::from_millis(5000));
    h.exporter.process_timers();
    assert_eq!(h.transport.dialed().len(), 2);
}

#[test]
fn test_stop_session_outcomes() {
    let h = Harness::new(&[]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    assert_eq!(
        h.exporter
            .stop_session(S1, SessionStopReason::EndOfData, Duration::from_secs(1))
            .unwrap(),
        StopOutcome::LogicallyStopped
    );

    h.exporter.start_session(S1).unwrap();
    let handle = h.bring_up(1);
    h.send(1);
    let config_id = h.exporter.get_session(S1).unwrap().configuration_ids[0];
    h.exporter.data_acknowledged(handle, S1, config_id, 0).unwrap();

    assert_eq!(
        h.exporter
            .stop_session(S1, SessionStopReason::EndOfData, Duration::from_secs(1))
            .unwrap(),
        StopOutcome::Stopped
    );
    let stop = h
        .transport
        .sent_messages(handle)
        .into_iter()
        .find_map(|(_, m)| match m {
            Message::SessionStop(stop) => Some(stop),
            _ => None,
        })
        .expect("no SESSION_STOP sent");
    assert_eq!(stop.reason, SessionStopReason::EndOfData);
    assert_eq!(h.cs_state("A"), CSState::Ready);
    assert!(!h.exporter.get_session(S1).unwrap().running);

    assert!(matches!(
        h.exporter
            .stop_session(S1, SessionStopReason::EndOfData, Duration::from_secs(1)),
        Err(ExporterError::SessionNotRunning(_))
    ));
    assert!(matches!(
        h.exporter.send_data(S1, USAGE, &usage(1)),
        Err(ExporterError::SessionNotRunning(_))
    ));
}

#[test]
fn test_inbound_connection_from_unknown_peer() {
    let h = Harness::new(&[]);
    h.exporter.start().unwrap();
    let handle = h.transport.accept();
    let peer: SocketAddr = "10.9.9.9:50000".parse().unwrap();

    let name = h.exporter.inbound_connection(handle, peer).unwrap();
    assert_eq!(name, "dummy-10.9.9.9:50000");
    let info = h.exporter.get_collector(&name).unwrap();
    assert!(info.is_dummy);
    assert_eq!(info.connections.len(), 1);
    assert_eq!(h.events.count(EventKind::ServerConnected), 1);

    h.exporter.connection_closed(handle, DisconnectReason::Tcp).unwrap();
    assert!(h.exporter.list_collectors().is_empty());
    assert_eq!(h.events.count(EventKind::AllServersDisconnected), 1);
}

#[test]
fn test_keep_alives() {
    let h = Harness::new(&[(KEEP_ALIVE_INTERVAL, "1000")])
        .with_session()
        .with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.bring_up(1);

    h.clock.advance(Duration::from_millis(1500));
    h.exporter.process_timers();
    assert!(h
        .transport
        .sent_messages(handle)
        .iter()
        .any(|(_, m)| *m == Message::KeepAlive));

    // Hearing from the collector postpones the liveness deadline.
    h.exporter.message_received(handle).unwrap();
    h.clock.advance(Duration::from_millis(600));
    h.exporter.process_timers();
    assert!(h.transport.is_open(handle));

    h.clock.advance(Duration::from_millis(1500));
    h.exporter.process_timers();
    assert!(h.transport.closed().contains(&handle));
    assert_eq!(h.events.count(EventKind::ServerDisconnected(DisconnectReason::Timeout)), 1);
    assert!(h.exporter.get_session(S1).unwrap().active_collector.is_none());
}

#[test]
fn test_handover_to_requested_collector() {
    let h = Harness::new(&[])
        .with_session()
        .with_collector("A", 1, 1)
        .with_collector("B", 2, 2);
    h.exporter.start().unwrap();
    let a = h.bring_up(1);
    let b = h.bring_up(2);
    h.send(1);

    h.exporter.activate_collector_session(b, S1).unwrap();

    let stop = h
        .transport
        .sent_messages(a)
        .into_iter()
        .find_map(|(_, m)| match m {
            Message::SessionStop(stop) => Some(stop),
            _ => None,
        })
        .expect("no SESSION_STOP on the old collector");
    assert_eq!(stop.reason, SessionStopReason::HandingOver);
    assert_eq!(h.cs_state("A"), CSState::Ready);
    assert_eq!(h.cs_state("B"), CSState::Active);
    assert_eq!(
        h.exporter.get_session(S1).unwrap().active_collector.as_deref(),
        Some("B")
    );
    assert_eq!(h.data_sequences(b), vec![(0, true)]);

    // Activating the current active collector is a no-op.
    h.exporter.activate_collector_session(b, S1).unwrap();
    assert_eq!(h.data_sequences(b).len(), 1);
}

#[test]
fn test_reconfigure_applies_in_place() {
    let h = Harness::new(&[(WINDOW_SIZE, "1")]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.bring_up(1);
    h.send(1);
    h.send(2);
    assert_eq!(h.data_sequences(handle).len(), 1);

    let params = ParameterStore::new().with(WINDOW_SIZE, "8").unwrap();
    h.exporter.reconfigure(&params).unwrap();
    assert_eq!(h.exporter.get_parameter(WINDOW_SIZE).as_deref(), Some("8"));
    assert_eq!(h.exporter.config().window_size, 8);
    assert_eq!(h.data_sequences(handle).len(), 2);
    assert!(h.transport.is_open(handle));

    assert!(h.exporter.set_parameter(WINDOW_SIZE, "0").is_err());
    assert!(h.exporter.set_parameter("no.such.key", "1").is_err());
}

#[test]
fn test_start_is_rejected_while_stop_drains() {
    let h = Harness::new(&[(DRAIN_POLL_INTERVAL, "5")])
        .with_session()
        .with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.bring_up(1);
    h.send(1);

    let stopper = h.exporter.clone();
    let stop = std::thread::spawn(move || {
        stopper.stop_session(S1, SessionStopReason::EndOfData, Duration::from_millis(300))
    });
    std::thread::sleep(Duration::from_millis(50));
    assert!(matches!(
        h.exporter.start_session(S1),
        Err(ExporterError::SessionLogicallyRunning(_))
    ));
    assert_eq!(stop.join().unwrap().unwrap(), StopOutcome::Stopped);
    assert!(!h.exporter.get_session(S1).unwrap().running);
    assert_eq!(h.cs_state("A"), CSState::Ready);

    h.exporter.start_session(S1).unwrap();
    assert_eq!(h.cs_state("A"), CSState::Active);
    assert_eq!(h.send(2), 1);
    assert_eq!(h.data_sequences(handle), vec![(0, false), (1, false)]);
}

#[test]
fn test_reconfigure_restarts_listener_and_sessions() {
    let h = Harness::new(&[]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let old = h.bring_up(1);
    h.send(1);
    assert_eq!(h.data_sequences(old), vec![(0, false)]);

    let params = ParameterStore::new().with(EXPORTER_PORT, "5000").unwrap();
    h.exporter.reconfigure(&params).unwrap();
    assert!(h.transport.closed().contains(&old));
    assert_eq!(h.transport.listening().map(|a| a.port()), Some(5000));
    assert!(h.exporter.get_session(S1).unwrap().running);
    let stats = h.exporter.get_session_statistics(S1).unwrap();
    assert_eq!(stats.outstanding, 1);
    assert_eq!(stats.unacknowledged, 0);

    let new = h.bring_up(1);
    assert_ne!(new, old);
    assert_eq!(h.cs_state("A"), CSState::Active);
    assert_eq!(h.data_sequences(new), vec![(0, true)]);
    h.send(2);
    assert_eq!(h.data_sequences(new), vec![(0, true), (1, false)]);
}

#[test]
fn test_restart_retransmits_unacknowledged_records() {
    let h = Harness::new(&[]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let old = h.bring_up(1);
    h.send(1);
    h.send(2);
    let config_id = h.exporter.get_session(S1).unwrap().configuration_ids[0];
    h.exporter.data_acknowledged(old, S1, config_id, 0).unwrap();

    h.exporter.stop().unwrap();
    let stats = h.exporter.get_session_statistics(S1).unwrap();
    assert_eq!(stats.outstanding, 1);
    assert_eq!(stats.unacknowledged, 0);

    h.exporter.start().unwrap();
    let new = h.bring_up(1);
    let start = h
        .transport
        .sent_messages(new)
        .into_iter()
        .find_map(|(_, m)| match m {
            Message::SessionStart(start) => Some(start),
            _ => None,
        })
        .expect("no SESSION_START sent");
    assert_eq!(start.first_record_sequence, 1);
    assert_eq!(h.data_sequences(new), vec![(1, true)]);
}

#[test]
fn test_collector_frames_drive_the_exporter() {
    use ipdr_exporter::BasicProtocol;
    use ipdr_wire::{ConnectResponse, DataAck, FlowStop};

    let h = Harness::new(&[]).with_session().with_collector("A", 1, 1);
    h.exporter.start().unwrap();
    let handle = h.transport.last_dial_to(addr(1)).unwrap();
    h.exporter.connection_established(handle, None).unwrap();
    assert_eq!(h.cs_state("A"), CSState::Disconnected);

    let frame = |session: u8, message: Message| message.encode(session).unwrap();
    let response = ConnectResponse {
        capabilities: 0,
        keep_alive_interval: 30,
        vendor_id: "collector".into(),
    };
    BasicProtocol::handle_frame(&h.exporter, handle, &frame(0, Message::ConnectResponse(response))).unwrap();
    assert_eq!(h.cs_state("A"), CSState::Active);

    h.send(1);
    h.send(2);
    let config_id = h.exporter.get_session(S1).unwrap().configuration_ids[0];
    let ack = DataAck { config_id, sequence: 1 };
    BasicProtocol::handle_frame(&h.exporter, handle, &frame(1, Message::DataAck(ack))).unwrap();
    assert_eq!(h.events.count(EventKind::QueueEmpty), 1);

    let stop = FlowStop {
        reason_code: 0,
        info: String::new(),
    };
    BasicProtocol::handle_frame(&h.exporter, handle, &frame(1, Message::FlowStop(stop))).unwrap();
    assert_eq!(h.cs_state("A"), CSState::Disconnected);
    assert!(h.exporter.get_session(S1).unwrap().active_collector.is_none());

    BasicProtocol::handle_frame(&h.exporter, handle, &frame(1, Message::FlowStart)).unwrap();
    assert_eq!(h.cs_state("A"), CSState::Active);
    let starts = h
        .transport
        .sent_messages(handle)
        .iter()
        .filter(|(_, m)| matches!(m, Message::SessionStart(_)))
        .count();
    assert_eq!(starts, 2);

    // Frames for a session the exporter does not know raise an error event.
    assert!(BasicProtocol::handle_frame(&h.exporter, handle, &frame(7, Message::FlowStart)).is_err());
    assert_eq!(
        h.events.count(EventKind::Error(ipdr_exporter::ErrorReason::UnknownSession)),
        1
    );

    BasicProtocol::handle_frame(&h.exporter, handle, &frame(0, Message::Disconnect)).unwrap();
    assert!(h.transport.closed().contains(&handle));
    assert_eq!(h.events.count(EventKind::AllServersDisconnected), 1);
}
