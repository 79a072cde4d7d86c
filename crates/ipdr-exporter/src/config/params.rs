//! Named parameter store.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use super::ConfigError;

/// Whether a parameter change can be applied without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Applied in place by `reconfigure`.
    Soft,
    /// Changing it restarts the listener and every session.
    Hard,
}

/// A known parameter and its default.
#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub key: &'static str,
    pub default: &'static str,
    pub kind: ParamKind,
}

pub const EXPORTER_ADDRESS: &str = "exporter.address";
pub const EXPORTER_PORT: &str = "exporter.port";
pub const WINDOW_SIZE: &str = "exporter.windowSize";
pub const WINDOW_TIMEOUT: &str = "exporter.windowTimeout";
pub const AUTOCONNECT_INTERVAL: &str = "exporter.autoconnectInterval";
pub const KEEP_ALIVE_INTERVAL: &str = "exporter.keepAliveInterval";
pub const STATISTICS_INTERVAL: &str = "exporter.statisticsInterval";
pub const QUEUE_CAPACITY: &str = "exporter.queueCapacity";
pub const DRAIN_POLL_INTERVAL: &str = "exporter.drainPollInterval";
pub const VENDOR_ID: &str = "exporter.vendorId";
pub const NEGOTIATION: &str = "protocol.negotiation";
pub const STRUCTURES: &str = "protocol.structures";
pub const MULTI_SESSION: &str = "protocol.multiSession";
pub const DISCOVERY_ENABLED: &str = "discovery.enabled";
pub const DISCOVERY_PORT: &str = "discovery.port";

/// Every parameter the exporter understands.
pub const PARAMETERS: &[ParamDef] = &[
    ParamDef { key: EXPORTER_ADDRESS, default: "0.0.0.0", kind: ParamKind::Hard },
    ParamDef { key: EXPORTER_PORT, default: "4737", kind: ParamKind::Hard },
    ParamDef { key: WINDOW_SIZE, default: "128", kind: ParamKind::Soft },
    ParamDef { key: WINDOW_TIMEOUT, default: "5000", kind: ParamKind::Soft },
    ParamDef { key: AUTOCONNECT_INTERVAL, default: "5000", kind: ParamKind::Soft },
    ParamDef { key: KEEP_ALIVE_INTERVAL, default: "30000", kind: ParamKind::Soft },
    ParamDef { key: STATISTICS_INTERVAL, default: "60000", kind: ParamKind::Soft },
    ParamDef { key: QUEUE_CAPACITY, default: "100000", kind: ParamKind::Soft },
    ParamDef { key: DRAIN_POLL_INTERVAL, default: "10", kind: ParamKind::Soft },
    ParamDef { key: VENDOR_ID, default: "ipdr-exporter", kind: ParamKind::Soft },
    ParamDef { key: NEGOTIATION, default: "true", kind: ParamKind::Soft },
    ParamDef { key: STRUCTURES, default: "false", kind: ParamKind::Soft },
    ParamDef { key: MULTI_SESSION, default: "true", kind: ParamKind::Soft },
    ParamDef { key: DISCOVERY_ENABLED, default: "true", kind: ParamKind::Soft },
    ParamDef { key: DISCOVERY_PORT, default: "4737", kind: ParamKind::Hard },
];

/// Looks up the definition of a known parameter.
pub fn definition(key: &str) -> Option<&'static ParamDef> {
    PARAMETERS.iter().find(|p| p.key == key)
}

/// String-keyed parameter values layered over the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterStore {
    values: BTreeMap<String, String>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a known parameter. Values are validated when resolved.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), ConfigError> {
        if definition(key).is_none() {
            return Err(ConfigError::UnknownParameter(key.to_string()));
        }
        self.values.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Result<Self, ConfigError> {
        self.set(key, value)?;
        Ok(self)
    }

    /// Restores a parameter to its default.
    pub fn unset(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Returns the effective value: explicit if set, else the default.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .or_else(|| definition(key).map(|p| p.default))
    }

    /// Iterates over explicitly set parameters.
    pub fn explicit(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies every explicit value of `other` into `self`.
    pub fn merge(&mut self, other: &ParameterStore) {
        for (k, v) in other.explicit() {
            self.values.insert(k.to_string(), v.to_string());
        }
    }

    fn raw(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::UnknownParameter(key.to_string()))
    }

    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, ConfigError> {
        let raw = self.raw(key)?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| Self::invalid(key, raw, e.to_string()))
    }

    pub fn get_u32(&self, key: &str) -> Result<u32, ConfigError> {
        let value = self.get_u64(key)?;
        u32::try_from(value).map_err(|_| Self::invalid(key, &value.to_string(), "out of range"))
    }

    pub fn get_u16(&self, key: &str) -> Result<u16, ConfigError> {
        let value = self.get_u64(key)?;
        u16::try_from(value).map_err(|_| Self::invalid(key, &value.to_string(), "out of range"))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let raw = self.raw(key)?;
        match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(Self::invalid(key, raw, "expected a boolean")),
        }
    }

    /// Reads a millisecond value as a `Duration`.
    pub fn get_duration_ms(&self, key: &str) -> Result<Duration, ConfigError> {
        self.get_u64(key).map(Duration::from_millis)
    }

    pub fn get_addr(&self, key: &str) -> Result<IpAddr, ConfigError> {
        let raw = self.raw(key)?;
        raw.trim()
            .parse::<IpAddr>()
            .map_err(|e| Self::invalid(key, raw, e.to_string()))
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        self.raw(key).map(str::to_string)
    }
}
