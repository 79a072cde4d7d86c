//! Audit trail of management operations.
//!
//! Each public operation that changes exporter state (sessions, collectors,
//! associations, templates, parameters, start/stop) leaves one
//! [`AuditRecord`] on the `ipdr_audit` tracing target through
//! [`audit_log!`](crate::audit_log). The record is attached as JSON so it can
//! be shipped without parsing the message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of change an operation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Exporter and session start/stop.
    Lifecycle,
    /// Parameters and transmission contexts.
    Configuration,
    /// Objects created or rebound.
    Provisioning,
    /// Objects removed.
    Decommission,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Configuration => "configuration",
            Self::Provisioning => "provisioning",
            Self::Decommission => "decommission",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The object an operation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditObject {
    Exporter,
    Session,
    Collector,
    /// A session/collector binding.
    Association,
    Template,
    Parameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One audited operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub operation: String,
    pub object: AuditObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// A successful operation on the exporter itself, stamped now. Narrow it
    /// with [`object`](Self::object) and [`id`](Self::id).
    pub fn new(category: AuditCategory, operation: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            operation: operation.into(),
            object: AuditObject::Exporter,
            id: None,
            outcome: AuditOutcome::Success,
            details: None,
            error: None,
        }
    }

    pub fn object(mut self, object: AuditObject) -> Self {
        self.object = object;
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.error = Some(error.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"audit_error":"{}"}}"#, e))
    }
}

/// Logs an [`AuditRecord`]: `info` on success, `warn` on failure.
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {{
        let record: &$crate::audit::AuditRecord = &$record;
        let id = record.id.as_deref().unwrap_or("-");
        match record.outcome {
            $crate::audit::AuditOutcome::Success => ::tracing::info!(
                target: "ipdr_audit",
                category = %record.category,
                object = ?record.object,
                id,
                record = %record.to_json(),
                "{} succeeded",
                record.operation
            ),
            $crate::audit::AuditOutcome::Failure => ::tracing::warn!(
                target: "ipdr_audit",
                category = %record.category,
                object = ?record.object,
                id,
                error = record.error.as_deref().unwrap_or(""),
                record = %record.to_json(),
                "{} failed",
                record.operation
            ),
        }
    }};
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides
/// `log_level`; `json` switches to one JSON object per line.
pub fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_defaults_to_exporter_success() {
        let record = AuditRecord::new(AuditCategory::Lifecycle, "start");
        assert_eq!(record.object, AuditObject::Exporter);
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.id, None);
    }

    #[test]
    fn test_failed_record_keeps_error() {
        let record = AuditRecord::new(AuditCategory::Decommission, "remove_collector")
            .object(AuditObject::Collector)
            .id("C1")
            .failed("collector session 1:C1 is active");

        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("collector session 1:C1 is active"));
        audit_log!(record);
    }

    #[test]
    fn test_json_rendering() {
        let record = AuditRecord::new(AuditCategory::Configuration, "reconfigure")
            .details(serde_json::json!({ "parameters": ["exporter.windowSize"] }));

        let value: serde_json::Value = serde_json::from_str(&record.to_json()).unwrap();
        assert_eq!(value["category"], "configuration");
        assert_eq!(value["object"], "exporter");
        assert_eq!(value["outcome"], "success");
        assert_eq!(value["details"]["parameters"][0], "exporter.windowSize");
        assert!(value.get("id").is_none());
        assert!(value.get("error").is_none());
    }
}
