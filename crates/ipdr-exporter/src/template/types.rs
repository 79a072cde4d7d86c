//! Key and template types.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::encoder::{FieldOrderEncoder, RecordEncoder};

/// IPDR XDR type codes.
///
/// Derived types carry their base type in the low byte of the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    Int,
    UnsignedInt,
    Long,
    UnsignedLong,
    Float,
    Double,
    HexBinary,
    String,
    Boolean,
    Byte,
    UnsignedByte,
    Short,
    UnsignedShort,
    DateTime,
    DateTimeMsec,
    Ipv4Addr,
    Ipv6Addr,
    Uuid,
    DateTimeUsec,
    MacAddress,
    IpAddr,
}

impl KeyType {
    /// Returns the IPDR type code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Int => 0x21,
            Self::UnsignedInt => 0x22,
            Self::Long => 0x23,
            Self::UnsignedLong => 0x24,
            Self::Float => 0x25,
            Self::Double => 0x26,
            Self::HexBinary => 0x27,
            Self::String => 0x28,
            Self::Boolean => 0x29,
            Self::Byte => 0x2a,
            Self::UnsignedByte => 0x2b,
            Self::Short => 0x2c,
            Self::UnsignedShort => 0x2d,
            Self::DateTime => 0x122,
            Self::DateTimeMsec => 0x224,
            Self::Ipv4Addr => 0x322,
            Self::Ipv6Addr => 0x427,
            Self::Uuid => 0x527,
            Self::DateTimeUsec => 0x623,
            Self::MacAddress => 0x723,
            Self::IpAddr => 0x827,
        }
    }

    /// Creates a key type from its IPDR type code.
    pub fn from_code(code: u32) -> Option<Self> {
        ALL_KEY_TYPES.iter().copied().find(|t| t.code() == code)
    }

    /// Returns the primitive type that defines the wire encoding.
    pub fn base(&self) -> KeyType {
        match self {
            Self::DateTime | Self::Ipv4Addr => Self::UnsignedInt,
            Self::DateTimeMsec => Self::UnsignedLong,
            Self::DateTimeUsec | Self::MacAddress => Self::Long,
            Self::Ipv6Addr | Self::Uuid | Self::IpAddr => Self::HexBinary,
            other => *other,
        }
    }

    /// Returns the schema name of the type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::UnsignedInt => "unsignedInt",
            Self::Long => "long",
            Self::UnsignedLong => "unsignedLong",
            Self::Float => "float",
            Self::Double => "double",
            Self::HexBinary => "hexBinary",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::UnsignedByte => "unsignedByte",
            Self::Short => "short",
            Self::UnsignedShort => "unsignedShort",
            Self::DateTime => "dateTime",
            Self::DateTimeMsec => "dateTimeMsec",
            Self::Ipv4Addr => "ipV4Addr",
            Self::Ipv6Addr => "ipV6Addr",
            Self::Uuid => "uuid",
            Self::DateTimeUsec => "dateTimeUsec",
            Self::MacAddress => "macAddress",
            Self::IpAddr => "ipAddr",
        }
    }
}

const ALL_KEY_TYPES: [KeyType; 21] = [
    KeyType::Int,
    KeyType::UnsignedInt,
    KeyType::Long,
    KeyType::UnsignedLong,
    KeyType::Float,
    KeyType::Double,
    KeyType::HexBinary,
    KeyType::String,
    KeyType::Boolean,
    KeyType::Byte,
    KeyType::UnsignedByte,
    KeyType::Short,
    KeyType::UnsignedShort,
    KeyType::DateTime,
    KeyType::DateTimeMsec,
    KeyType::Ipv4Addr,
    KeyType::Ipv6Addr,
    KeyType::Uuid,
    KeyType::DateTimeUsec,
    KeyType::MacAddress,
    KeyType::IpAddr,
];

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_KEY_TYPES
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown key type: {}", s))
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One field of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub id: u32,
    pub name: String,
    pub label: String,
    pub key_type: KeyType,
    /// Configured enablement.
    pub enabled: bool,
    /// Collector-negotiated override, cleared by a template reset.
    pub(crate) negotiated: Option<bool>,
}

impl Key {
    /// Creates an enabled key whose label equals its name.
    pub fn new(id: u32, name: impl Into<String>, key_type: KeyType) -> Self {
        let name = name.into();
        Self {
            id,
            label: name.clone(),
            name,
            key_type,
            enabled: true,
            negotiated: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns true if the key is part of the effective field layout.
    pub fn is_effective(&self) -> bool {
        self.negotiated.unwrap_or(self.enabled)
    }

    /// Returns the negotiated override, if any.
    pub fn negotiated(&self) -> Option<bool> {
        self.negotiated
    }
}

/// Description of a template to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateConfig {
    pub id: u16,
    pub schema_name: String,
    pub type_name: String,
    /// Keys in wire field order.
    pub keys: Vec<Key>,
}

impl TemplateConfig {
    pub fn new(id: u16, schema_name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id,
            schema_name: schema_name.into(),
            type_name: type_name.into(),
            keys: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.keys.push(key);
        self
    }
}

/// A record type owned by a session.
#[derive(Clone)]
pub struct Template {
    pub(crate) id: u16,
    pub(crate) schema_name: String,
    pub(crate) type_name: String,
    pub(crate) keys: Vec<Key>,
    pub(crate) encoder: Arc<dyn RecordEncoder>,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("schema_name", &self.schema_name)
            .field("type_name", &self.type_name)
            .field("keys", &self.keys)
            .finish()
    }
}

impl Template {
    /// Builds a template from its description. Duplicate key ids are rejected.
    pub(crate) fn from_config(
        config: TemplateConfig,
        encoder: Option<Arc<dyn RecordEncoder>>,
    ) -> Result<Self, u32> {
        let mut seen = std::collections::HashSet::new();
        for key in &config.keys {
            if !seen.insert(key.id) {
                return Err(key.id);
            }
        }
        Ok(Self {
            id: config.id,
            schema_name: config.schema_name,
            type_name: config.type_name,
            keys: config.keys,
            encoder: encoder.unwrap_or_else(|| Arc::new(FieldOrderEncoder)),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn key(&self, key_id: u32) -> Option<&Key> {
        self.keys.iter().find(|k| k.id == key_id)
    }

    pub(crate) fn key_mut(&mut self, key_id: u32) -> Option<&mut Key> {
        self.keys.iter_mut().find(|k| k.id == key_id)
    }

    /// Appends a key at the end of the field order. Returns false if the id
    /// is already present.
    pub(crate) fn add_key(&mut self, key: Key) -> bool {
        if self.key(key.id).is_some() {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub(crate) fn remove_key(&mut self, key_id: u32) -> Option<Key> {
        let pos = self.keys.iter().position(|k| k.id == key_id)?;
        Some(self.keys.remove(pos))
    }

    /// Drops every negotiated override, returning to the configured baseline.
    pub(crate) fn reset(&mut self) {
        for key in &mut self.keys {
            key.negotiated = None;
        }
    }

    /// Captures the effective field layout.
    pub fn snapshot(&self) -> TemplateSnapshot {
        TemplateSnapshot {
            id: self.id,
            schema_name: self.schema_name.clone(),
            type_name: self.type_name.clone(),
            fields: self
                .keys
                .iter()
                .filter(|k| k.is_effective())
                .map(|k| FieldDescriptor {
                    key_id: k.id,
                    name: k.name.clone(),
                    key_type: k.key_type,
                })
                .collect(),
        }
    }
}

/// One field of a frozen template layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub key_id: u32,
    pub name: String,
    pub key_type: KeyType,
}

/// Immutable copy of a template's effective layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub id: u16,
    pub schema_name: String,
    pub type_name: String,
    pub fields: Vec<FieldDescriptor>,
}

/// Public view of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub id: u16,
    pub schema_name: String,
    pub type_name: String,
    pub keys: Vec<Key>,
}

impl From<&Template> for TemplateInfo {
    fn from(t: &Template) -> Self {
        Self {
            id: t.id,
            schema_name: t.schema_name.clone(),
            type_name: t.type_name.clone(),
            keys: t.keys.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn template() -> Template {
        let config = TemplateConfig::new(10, "DOCSIS-Type", "SAMIS")
            .with_key(Key::new(1, "CmtsHostName", KeyType::String))
            .with_key(Key::new(2, "RecType", KeyType::UnsignedInt).disabled())
            .with_key(Key::new(3, "CmMacAddr", KeyType::MacAddress));
        Template::from_config(config, None).unwrap()
    }

    #[test]
    fn test_key_type_codes() {
        assert_eq!(KeyType::from_code(0x28), Some(KeyType::String));
        assert_eq!(KeyType::from_code(0x723), Some(KeyType::MacAddress));
        assert_eq!(KeyType::MacAddress.base(), KeyType::Long);
        assert_eq!(KeyType::Ipv4Addr.base(), KeyType::UnsignedInt);
        assert_eq!("ipV6Addr".parse::<KeyType>().unwrap(), KeyType::Ipv6Addr);
        assert!("bogus".parse::<KeyType>().is_err());
    }

    #[test]
    fn test_snapshot_keeps_field_order_of_enabled_keys() {
        let snap = template().snapshot();
        let ids: Vec<u32> = snap.fields.iter().map(|f| f.key_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_negotiated_override_and_reset() {
        let mut t = template();
        t.key_mut(2).unwrap().negotiated = Some(true);
        t.key_mut(3).unwrap().negotiated = Some(false);
        let ids: Vec<u32> = t.snapshot().fields.iter().map(|f| f.key_id).collect();
        assert_eq!(ids, vec![1, 2]);

        t.reset();
        let ids: Vec<u32> = t.snapshot().fields.iter().map(|f| f.key_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let config = TemplateConfig::new(1, "s", "t")
            .with_key(Key::new(5, "a", KeyType::Int))
            .with_key(Key::new(5, "b", KeyType::Int));
        assert_eq!(Template::from_config(config, None).unwrap_err(), 5);

        let mut t = template();
        assert!(!t.add_key(Key::new(1, "dup", KeyType::Int)));
        assert!(t.add_key(Key::new(4, "new", KeyType::Int)));
        assert_eq!(t.keys().last().unwrap().id, 4);
        assert!(t.remove_key(4).is_some());
        assert!(t.remove_key(4).is_none());
    }
}
