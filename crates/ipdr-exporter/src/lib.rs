//! IPDR/SP exporter protocol core.
//!
//! An [`Exporter`] owns sessions, templates and collectors, and streams
//! records built against a session's templates to the session's active
//! collector over IPDR/SP, with windowed acknowledgment, failover between
//! prioritized collectors and retransmission of unacknowledged records.
//!
//! The core is synchronous and has no sockets of its own: it talks to the
//! network through a [`Transport`] and is driven by the protocol-facing
//! operations (`connection_established`, `data_acknowledged`, ...) plus
//! [`Exporter::process_timers`]. The [`runtime`] module wires it to tokio.

pub mod audit;
pub mod collector;
pub mod collector_session;
pub mod config;
pub mod error;
pub mod events;
pub mod exporter;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod template;
pub mod timer;
pub mod transport;
pub mod types;

pub use audit::{init_logging, AuditCategory, AuditObject, AuditOutcome, AuditRecord};
pub use collector::{CollectorConfig, CollectorInfo, ConnectionInfo, ConnectionState, Direction};
pub use collector_session::{AssocOutcome, CSState, CollectorSessionInfo};
pub use config::{ConfigError, ExporterConfig, ExporterFile, ParameterStore};
pub use error::{ErrorCategory, ExporterError, ExporterResult};
pub use events::{DisconnectReason, ErrorReason, Event, EventHandler, EventKind, EventLog, Severity};
pub use exporter::{Exporter, ExporterBuilder};
pub use protocol::{BasicProtocol, Candidate, ProtocolHandler, SessionStartInfo};
pub use queue::{MemoryQueue, QueueError, QueuedRecord, RecordQueue};
pub use session::{SessionInfo, SessionStatistics, StopOutcome};
pub use stats::{Counters, Rates};
pub use template::{
    ConfigurationIdCallbacks, FieldValue, Key, KeyNegotiation, KeyType, Record, RecordEncoder,
    TemplateConfig, TemplateInfo,
};
pub use timer::{Clock, ManualClock, SystemClock};
pub use transport::{MemoryTransport, Transport, TransportError};
pub use types::{CollectorId, CollectorSessionId, ConnectionId, SessionId, TransportHandle};
