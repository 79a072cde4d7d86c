//! The exporter core.
//!
//! [`Exporter`] is a cheap, cloneable handle around one lock-protected
//! state. Every public operation takes the lock, mutates state, and releases
//! it before buffered events are delivered to the registered handlers.
//!
//! Operations are grouped by concern:
//!
//! - `lifecycle`: start, stop, reconfigure, parameters, timers
//! - `sessions`: session management and queue draining
//! - `collectors`: collectors and collector-session associations
//! - `templates`: templates, keys and negotiation
//! - `pipeline`: record building and transmission
//! - `link`: connection and collector-session state driven by the transport

mod collectors;
mod inner;
mod lifecycle;
mod link;
mod pipeline;
mod sessions;
mod templates;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use ipdr_wire::Message;
use parking_lot::{Mutex, RwLock};

use crate::audit::AuditRecord;
use crate::config::{ExporterConfig, ParameterStore};
use crate::error::ExporterResult;
use crate::events::{Event, EventHandler};
use crate::protocol::{BasicProtocol, ProtocolHandler};
use crate::queue::{MemoryQueue, RecordQueue};
use crate::template::{ConfigurationIdCallbacks, DefaultConfigurationIds};
use crate::timer::{Clock, SystemClock, TimerQueue};
use crate::transport::Transport;
use crate::types::{HandleAllocator, TransportHandle};

pub(crate) use inner::ExporterInner;

struct Shared {
    inner: Mutex<ExporterInner>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

/// Handle to an IPDR exporter.
#[derive(Clone)]
pub struct Exporter {
    shared: Arc<Shared>,
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Exporter")
            .field("started", &inner.started)
            .field("sessions", &inner.sessions.len())
            .field("collectors", &inner.collectors.len())
            .finish()
    }
}

/// Emits the audit record for an operation according to its result.
fn audit_result<T>(record: AuditRecord, result: &ExporterResult<T>) {
    let record = match result {
        Ok(_) => record,
        Err(e) => record.failed(e.to_string()),
    };
    crate::audit_log!(record);
}

/// Configures the pluggable parts of an exporter.
pub struct ExporterBuilder {
    params: ParameterStore,
    transport: Arc<dyn Transport>,
    queue: Option<Box<dyn RecordQueue>>,
    protocol: Arc<dyn ProtocolHandler>,
    config_ids: Arc<dyn ConfigurationIdCallbacks>,
    clock: Arc<dyn Clock>,
}

impl ExporterBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            params: ParameterStore::new(),
            transport,
            queue: None,
            protocol: Arc::new(BasicProtocol),
            config_ids: Arc::new(DefaultConfigurationIds),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn parameters(mut self, params: ParameterStore) -> Self {
        self.params = params;
        self
    }

    /// Replaces the default in-memory queue.
    pub fn queue(mut self, queue: Box<dyn RecordQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn protocol(mut self, protocol: Arc<dyn ProtocolHandler>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn configuration_ids(mut self, callbacks: Arc<dyn ConfigurationIdCallbacks>) -> Self {
        self.config_ids = callbacks;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the parameters and creates a stopped exporter.
    pub fn build(self) -> ExporterResult<Exporter> {
        let config = ExporterConfig::from_store(&self.params)?;
        let mut queue = self
            .queue
            .unwrap_or_else(|| Box::new(MemoryQueue::new(config.queue_capacity, config.window_size)));
        queue.initialize(config.queue_capacity, config.window_size);

        let inner = ExporterInner {
            params: self.params,
            config,
            started: false,
            boot_time: Utc::now(),
            sessions: BTreeMap::new(),
            collectors: BTreeMap::new(),
            collector_sessions: BTreeMap::new(),
            handles: HashMap::new(),
            collector_ids: HandleAllocator::default(),
            cs_ids: HandleAllocator::default(),
            connection_ids: HandleAllocator::default(),
            queue,
            transport: self.transport,
            protocol: self.protocol,
            config_ids: self.config_ids,
            clock: self.clock,
            timers: TimerQueue::new(),
            periodic: Vec::new(),
            pending_events: Vec::new(),
        };

        Ok(Exporter {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                handlers: RwLock::new(Vec::new()),
            }),
        })
    }
}

impl Exporter {
    pub fn builder(transport: Arc<dyn Transport>) -> ExporterBuilder {
        ExporterBuilder::new(transport)
    }

    /// Creates a stopped exporter with default queue, protocol and clock.
    pub fn init(params: ParameterStore, transport: Arc<dyn Transport>) -> ExporterResult<Self> {
        Self::builder(transport).parameters(params).build()
    }

    /// Registers a handler for exporter events.
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.shared.handlers.write().push(handler);
    }

    /// Registers a closure for exporter events.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_event_handler(Arc::new(handler));
    }

    /// Runs `f` under the exporter lock, then delivers the events it raised.
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut ExporterInner) -> R) -> R {
        let (result, events) = {
            let mut inner = self.shared.inner.lock();
            let result = f(&mut inner);
            (result, inner.take_events())
        };
        self.dispatch(&events);
        result
    }

    fn dispatch(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let handlers: Vec<Arc<dyn EventHandler>> = self.shared.handlers.read().clone();
        for event in events {
            for handler in &handlers {
                handler.on_event(event);
            }
        }
    }

    /// Resolved configuration currently in effect.
    pub fn config(&self) -> ExporterConfig {
        self.locked(|inner| inner.config.clone())
    }

    /// Encodes and sends a control message on a connection.
    pub fn send_control(&self, handle: TransportHandle, session: u8, message: Message) -> ExporterResult<()> {
        self.locked(|inner| {
            inner.connection_of(handle)?;
            let frame = message.encode(session)?;
            inner.transport.send(handle, frame)?;
            Ok(())
        })
    }
}
