//! TOML configuration file for the exporter daemon.
//!
//! ```toml
//! [parameters]
//! "exporter.port" = 4737
//! "exporter.windowSize" = 64
//!
//! [[sessions]]
//! id = 1
//! name = "usage"
//!
//! [[sessions.templates]]
//! id = 1
//! schema_name = "DOCSIS-Type"
//! type_name = "DOCSIS-Type"
//! keys = [{ id = 1, name = "CmtsHostName", key_type = "string" }]
//!
//! [[collectors]]
//! name = "primary"
//! address = "10.0.0.1"
//!
//! [[associations]]
//! session = 1
//! collector = "primary"
//! priority = 1
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ConfigError, ParameterStore};
use crate::collector::{CollectorConfig, DEFAULT_COLLECTOR_PORT};
use crate::error::ExporterResult;
use crate::exporter::Exporter;
use crate::template::{Key, KeyType, TemplateConfig};
use crate::types::SessionId;

/// One template key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySection {
    pub id: u32,
    pub name: String,
    /// Defaults to the name.
    #[serde(default)]
    pub label: Option<String>,
    /// IPDR type name, e.g. `unsignedInt` or `ipV4Addr`.
    pub key_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSection {
    pub id: u16,
    pub schema_name: String,
    pub type_name: String,
    #[serde(default)]
    pub keys: Vec<KeySection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    pub id: u8,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Random when omitted.
    #[serde(default)]
    pub document_id: Option<Uuid>,
    #[serde(default)]
    pub negotiable: bool,
    #[serde(default)]
    pub templates: Vec<TemplateSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSection {
    pub name: String,
    pub address: IpAddr,
    #[serde(default = "default_collector_port")]
    pub port: u16,
    /// Outbound pooled connections; 0 waits for the collector to connect.
    #[serde(default = "default_connections")]
    pub connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationSection {
    pub session: u8,
    pub collector: String,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: u32,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExporterFile {
    /// Exporter parameters by name. Values of any TOML type are stringified.
    #[serde(default)]
    pub parameters: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub sessions: Vec<SessionSection>,
    #[serde(default)]
    pub collectors: Vec<CollectorSection>,
    #[serde(default)]
    pub associations: Vec<AssociationSection>,
}

fn default_enabled() -> bool {
    true
}

fn default_collector_port() -> u16 {
    DEFAULT_COLLECTOR_PORT
}

fn default_connections() -> u32 {
    1
}

impl KeySection {
    fn to_key(&self) -> Result<Key, ConfigError> {
        let key_type: KeyType = self.key_type.parse().map_err(ConfigError::Invalid)?;
        let mut key = Key::new(self.id, self.name.clone(), key_type);
        if let Some(label) = &self.label {
            key = key.with_label(label.clone());
        }
        key.enabled = self.enabled;
        Ok(key)
    }
}

impl TemplateSection {
    pub fn to_config(&self) -> Result<TemplateConfig, ConfigError> {
        let mut config = TemplateConfig::new(self.id, self.schema_name.clone(), self.type_name.clone());
        for key in &self.keys {
            config = config.with_key(key.to_key()?);
        }
        Ok(config)
    }
}

impl CollectorSection {
    pub fn to_config(&self) -> CollectorConfig {
        CollectorConfig::new(self.name.clone(), self.address, self.port).with_connections(self.connections)
    }
}

impl ExporterFile {
    /// Parses a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Loads `path`, falling back to an empty configuration if it is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match Self::load(path) {
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Serializes the configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Parameters as a store. Fails on unknown names.
    pub fn parameter_store(&self) -> Result<ParameterStore, ConfigError> {
        let mut store = ParameterStore::new();
        for (key, value) in &self.parameters {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            store.set(key, value)?;
        }
        Ok(store)
    }

    /// Checks cross-references and uniqueness without touching an exporter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parameter_store()?;

        let mut session_ids = BTreeSet::new();
        for session in &self.sessions {
            if !session_ids.insert(session.id) {
                return Err(ConfigError::Invalid(format!("duplicate session {}", session.id)));
            }
            let mut template_ids = BTreeSet::new();
            for template in &session.templates {
                if !template_ids.insert(template.id) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate template {} in session {}",
                        template.id, session.id
                    )));
                }
                let mut key_ids = BTreeSet::new();
                for key in &template.keys {
                    if !key_ids.insert(key.id) {
                        return Err(ConfigError::Invalid(format!(
                            "duplicate key {} in template {}",
                            key.id, template.id
                        )));
                    }
                    key.to_key()?;
                }
            }
        }

        let mut collector_names = BTreeSet::new();
        for collector in &self.collectors {
            if collector.name.is_empty() {
                return Err(ConfigError::Invalid("collector name is empty".to_string()));
            }
            if !collector_names.insert(collector.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate collector '{}'",
                    collector.name
                )));
            }
        }

        for assoc in &self.associations {
            if !session_ids.contains(&assoc.session) {
                return Err(ConfigError::Invalid(format!(
                    "association references unknown session {}",
                    assoc.session
                )));
            }
            if !collector_names.contains(assoc.collector.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "association references unknown collector '{}'",
                    assoc.collector
                )));
            }
        }
        Ok(())
    }

    /// Creates the configured sessions, templates, collectors and
    /// associations on a stopped exporter.
    pub fn apply(&self, exporter: &Exporter) -> ExporterResult<()> {
        for section in &self.sessions {
            let id = SessionId(section.id);
            exporter.create_session(id, &section.name, &section.description)?;
            if let Some(document_id) = section.document_id {
                exporter.set_document_id(id, document_id)?;
            }
            exporter.set_negotiable(id, section.negotiable)?;
            for template in &section.templates {
                exporter.create_template(id, template.to_config()?, None)?;
            }
        }
        for collector in &self.collectors {
            exporter.create_collector(collector.to_config())?;
        }
        for assoc in &self.associations {
            exporter.assoc_collector_session(SessionId(assoc.session), &assoc.collector, assoc.priority)?;
        }
        info!(
            sessions = self.sessions.len(),
            collectors = self.collectors.len(),
            associations = self.associations.len(),
            "configuration applied"
        );
        Ok(())
    }
}
