//! Templates, keys and transmission contexts.
//!
//! A session owns mutable [`Template`]s. Applying them freezes the effective
//! field layout into an immutable [`TransmissionContext`] tagged with a
//! configuration id; records keep the id of the context they were built
//! against, so older contexts live until the queue no longer holds any of
//! their records.

mod context;
mod encoder;
mod types;

pub(crate) use context::ContextChain;
pub use context::{
    next_configuration_id, ConfigurationIdCallbacks, DefaultConfigurationIds, TransmissionContext,
};
pub use encoder::{EncodeError, FieldOrderEncoder, FieldValue, Record, RecordEncoder};
pub use types::{
    FieldDescriptor, Key, KeyType, Template, TemplateConfig, TemplateInfo, TemplateSnapshot,
};

/// A collector-requested change to one key's enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyNegotiation {
    pub template_id: u16,
    pub key_id: u32,
    pub enabled: bool,
}
