//! Exporter configuration.
//!
//! Parameters live in a string-keyed [`ParameterStore`]; the core resolves
//! them into a typed [`ExporterConfig`] at `start` and `reconfigure`. The
//! daemon reads the store, sessions, templates and collectors from a TOML
//! [`ExporterFile`].

mod file;
mod params;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipdr_wire::capabilities;
use thiserror::Error;

pub use file::{
    AssociationSection, CollectorSection, ExporterFile, KeySection, SessionSection,
    TemplateSection,
};
pub use params::{definition, ParamDef, ParamKind, ParameterStore, PARAMETERS};
pub use params::{
    AUTOCONNECT_INTERVAL, DISCOVERY_ENABLED, DISCOVERY_PORT, DRAIN_POLL_INTERVAL,
    EXPORTER_ADDRESS, EXPORTER_PORT, KEEP_ALIVE_INTERVAL, MULTI_SESSION, NEGOTIATION,
    QUEUE_CAPACITY, STATISTICS_INTERVAL, STRUCTURES, VENDOR_ID, WINDOW_SIZE, WINDOW_TIMEOUT,
};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Typed view of the parameter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub window_size: u32,
    pub window_timeout: Duration,
    pub autoconnect_interval: Duration,
    pub keep_alive_interval: Duration,
    pub statistics_interval: Duration,
    pub queue_capacity: usize,
    pub drain_poll_interval: Duration,
    pub vendor_id: String,
    pub negotiation: bool,
    pub structures: bool,
    pub multi_session: bool,
    pub discovery_enabled: bool,
    pub discovery_port: u16,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        // Must match the defaults in PARAMETERS.
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 4737,
            window_size: 128,
            window_timeout: Duration::from_millis(5000),
            autoconnect_interval: Duration::from_millis(5000),
            keep_alive_interval: Duration::from_millis(30000),
            statistics_interval: Duration::from_millis(60000),
            queue_capacity: 100_000,
            drain_poll_interval: Duration::from_millis(10),
            vendor_id: "ipdr-exporter".to_string(),
            negotiation: true,
            structures: false,
            multi_session: true,
            discovery_enabled: true,
            discovery_port: 4737,
        }
    }
}

impl ExporterConfig {
    /// Resolves every known parameter from `store`.
    pub fn from_store(store: &ParameterStore) -> Result<Self, ConfigError> {
        let config = Self {
            bind_address: store.get_addr(EXPORTER_ADDRESS)?,
            port: store.get_u16(EXPORTER_PORT)?,
            window_size: store.get_u32(WINDOW_SIZE)?,
            window_timeout: store.get_duration_ms(WINDOW_TIMEOUT)?,
            autoconnect_interval: store.get_duration_ms(AUTOCONNECT_INTERVAL)?,
            keep_alive_interval: store.get_duration_ms(KEEP_ALIVE_INTERVAL)?,
            statistics_interval: store.get_duration_ms(STATISTICS_INTERVAL)?,
            queue_capacity: store.get_u64(QUEUE_CAPACITY)? as usize,
            drain_poll_interval: store.get_duration_ms(DRAIN_POLL_INTERVAL)?,
            vendor_id: store.get_string(VENDOR_ID)?,
            negotiation: store.get_bool(NEGOTIATION)?,
            structures: store.get_bool(STRUCTURES)?,
            multi_session: store.get_bool(MULTI_SESSION)?,
            discovery_enabled: store.get_bool(DISCOVERY_ENABLED)?,
            discovery_port: store.get_u16(DISCOVERY_PORT)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::Invalid(format!("{} must be > 0", WINDOW_SIZE)));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(format!("{} must be > 0", QUEUE_CAPACITY)));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "{} must be > 0",
                DRAIN_POLL_INTERVAL
            )));
        }
        Ok(())
    }

    /// Address the transport listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Returns true if moving from `self` to `next` needs a hard restart.
    pub fn requires_restart(&self, next: &ExporterConfig) -> bool {
        self.bind_address != next.bind_address
            || self.port != next.port
            || self.discovery_port != next.discovery_port
    }

    /// Capability bits advertised in CONNECT.
    pub fn capabilities(&self) -> u32 {
        let mut caps = 0;
        if self.structures {
            caps |= capabilities::STRUCTURES;
        }
        if self.multi_session {
            caps |= capabilities::MULTISESSION;
        }
        if self.negotiation {
            caps |= capabilities::TEMPLATE_NEGOTIATION;
        }
        caps
    }

    /// Keep-alive interval in whole seconds, as carried on the wire.
    pub fn keep_alive_secs(&self) -> u32 {
        u32::try_from(self.keep_alive_interval.as_secs()).unwrap_or(u32::MAX)
    }
}
