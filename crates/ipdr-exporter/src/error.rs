//! Exporter error types.
//!
//! Every public operation returns [`ExporterResult`]. Callers that only care
//! about the broad class of a failure match on [`ExporterError::category`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::template::EncodeError;
use crate::transport::TransportError;
use crate::types::{SessionId, TransportHandle};

/// Result type alias for exporter operations.
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    /// Forbidden in the current running/active state.
    StateConflict,
    ResourceExhausted,
    Communication,
    /// A bounded wait ran out.
    WouldBlock,
    NotImplemented,
}

/// Errors returned by the exporter API.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    #[error("Collector '{0}' not found")]
    CollectorNotFound(String),

    #[error("Collector '{collector}' is not associated with session {session}")]
    CollectorSessionNotFound { session: SessionId, collector: String },

    #[error("Template {template_id} not found in session {session}")]
    TemplateNotFound { session: SessionId, template_id: u16 },

    #[error("Template {0} not found in any session")]
    TemplateNotFoundAnywhere(u16),

    #[error("Key {key_id} not found in template {template_id}")]
    KeyNotFound { template_id: u16, key_id: u32 },

    #[error("Unknown connection {0}")]
    ConnectionNotFound(TransportHandle),

    #[error("Session {0} already exists")]
    SessionExists(SessionId),

    #[error("Collector '{0}' already exists")]
    CollectorExists(String),

    #[error("Template {template_id} already exists in session {session}")]
    TemplateExists { session: SessionId, template_id: u16 },

    #[error("Key {key_id} already exists in template {template_id}")]
    KeyExists { template_id: u16, key_id: u32 },

    #[error("Exporter is already running")]
    AlreadyRunning,

    #[error("Exporter is not running")]
    NotRunning,

    #[error("Session {0} is running")]
    SessionRunning(SessionId),

    #[error("Session {0} is not running")]
    SessionNotRunning(SessionId),

    #[error("Session {0} still has an active collector")]
    SessionLogicallyRunning(SessionId),

    #[error("Collector '{collector}' is active for session {session}")]
    CollectorSessionActive { session: SessionId, collector: String },

    #[error("Collector '{collector}' is not ready for session {session}")]
    CollectorSessionNotReady { session: SessionId, collector: String },

    #[error("Session {0} has no active collector")]
    NoActiveCollector(SessionId),

    #[error("Queue for session {0} is full")]
    QueueFull(SessionId),

    #[error("Communication failure: {0}")]
    Communication(String),

    #[error("Timed out waiting for the queue to drain")]
    WouldBlock,

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Record encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Wire encoding failed: {0}")]
    Wire(#[from] ipdr_wire::WireError),
}

impl ExporterError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArgument(_) | Self::Config(_) | Self::Encode(_) | Self::Wire(_) => {
                ErrorCategory::InvalidArgument
            }
            Self::SessionNotFound(_)
            | Self::CollectorNotFound(_)
            | Self::CollectorSessionNotFound { .. }
            | Self::TemplateNotFound { .. }
            | Self::TemplateNotFoundAnywhere(_)
            | Self::KeyNotFound { .. }
            | Self::ConnectionNotFound(_) => ErrorCategory::NotFound,
            Self::SessionExists(_)
            | Self::CollectorExists(_)
            | Self::TemplateExists { .. }
            | Self::KeyExists { .. } => ErrorCategory::AlreadyExists,
            Self::AlreadyRunning
            | Self::NotRunning
            | Self::SessionRunning(_)
            | Self::SessionNotRunning(_)
            | Self::SessionLogicallyRunning(_)
            | Self::CollectorSessionActive { .. }
            | Self::CollectorSessionNotReady { .. }
            | Self::NoActiveCollector(_) => ErrorCategory::StateConflict,
            Self::QueueFull(_) => ErrorCategory::ResourceExhausted,
            Self::Communication(_) => ErrorCategory::Communication,
            Self::WouldBlock => ErrorCategory::WouldBlock,
            Self::NotImplemented(_) => ErrorCategory::NotImplemented,
        }
    }
}

impl From<TransportError> for ExporterError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unsupported(op) => Self::NotImplemented(op.to_string()),
            other => Self::Communication(other.to_string()),
        }
    }
}

impl From<QueueError> for ExporterError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { session, .. } => Self::QueueFull(session),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            ExporterError::SessionLogicallyRunning(SessionId(1)).category(),
            ErrorCategory::StateConflict
        );
        assert_eq!(ExporterError::WouldBlock.category(), ErrorCategory::WouldBlock);
        assert_eq!(
            ExporterError::CollectorExists("C1".into()).category(),
            ErrorCategory::AlreadyExists
        );
        assert_eq!(
            ExporterError::KeyNotFound { template_id: 1, key_id: 2 }.category(),
            ErrorCategory::NotFound
        );
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: ExporterError = TransportError::Unsupported("listen").into();
        assert_eq!(err.category(), ErrorCategory::NotImplemented);

        let err: ExporterError = TransportError::Refused("10.0.0.1:4737".into()).into();
        assert_eq!(err.category(), ErrorCategory::Communication);
    }

    #[test]
    fn test_queue_full_mapping() {
        let err: ExporterError = QueueError::Full {
            session: SessionId(3),
            capacity: 10,
        }
        .into();
        assert!(matches!(err, ExporterError::QueueFull(SessionId(3))));
        assert_eq!(err.category(), ErrorCategory::ResourceExhausted);
    }
}
