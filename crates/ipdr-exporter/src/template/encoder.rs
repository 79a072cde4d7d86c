//! Record encoding.
//!
//! The core hands a [`Record`] and the frozen [`TemplateSnapshot`] of the
//! current configuration to the template's [`RecordEncoder`] and ships the
//! resulting bytes as the DATA payload. [`FieldOrderEncoder`] writes each
//! effective field in template order using the XDR encoding of its base type.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, WriteBytesExt};
use thiserror::Error;
use uuid::Uuid;

use super::types::{KeyType, TemplateSnapshot};

/// Record encoding errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Record is missing field {name} (key {key_id})")]
    MissingField { key_id: u32, name: String },

    #[error("Field {name} does not hold a {expected} value")]
    TypeMismatch { name: String, expected: KeyType },

    #[error("Value of field {name} is out of range for {expected}")]
    OutOfRange { name: String, expected: KeyType },

    #[error("Encoder failure: {0}")]
    Custom(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A field value supplied by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Mac([u8; 6]),
    Uuid(Uuid),
}

/// Field values keyed by key id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<u32, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key_id: u32, value: FieldValue) -> Self {
        self.fields.insert(key_id, value);
        self
    }

    pub fn set(&mut self, key_id: u32, value: FieldValue) {
        self.fields.insert(key_id, value);
    }

    pub fn get(&self, key_id: u32) -> Option<&FieldValue> {
        self.fields.get(&key_id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Turns a record into DATA payload bytes.
pub trait RecordEncoder: Send + Sync {
    fn encode(&self, template: &TemplateSnapshot, record: &Record) -> Result<Vec<u8>, EncodeError>;
}

/// Encodes effective fields in template order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldOrderEncoder;

fn write_opaque(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), EncodeError> {
    out.write_u32::<BigEndian>(bytes.len() as u32)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn encode_field(
    out: &mut Vec<u8>,
    name: &str,
    key_type: KeyType,
    value: &FieldValue,
) -> Result<(), EncodeError> {
    let mismatch = || EncodeError::TypeMismatch {
        name: name.to_string(),
        expected: key_type,
    };
    let range = || EncodeError::OutOfRange {
        name: name.to_string(),
        expected: key_type,
    };

    match (key_type.base(), value) {
        (KeyType::Int, FieldValue::Int(v)) => {
            out.write_i32::<BigEndian>(i32::try_from(*v).map_err(|_| range())?)?
        }
        (KeyType::UnsignedInt, FieldValue::UInt(v)) => {
            out.write_u32::<BigEndian>(u32::try_from(*v).map_err(|_| range())?)?
        }
        (KeyType::UnsignedInt, FieldValue::Ipv4(addr)) => {
            out.write_u32::<BigEndian>(u32::from(*addr))?
        }
        (KeyType::Long, FieldValue::Int(v)) => out.write_i64::<BigEndian>(*v)?,
        (KeyType::Long, FieldValue::Mac(mac)) => {
            let mut buf = [0u8; 8];
            buf[2..].copy_from_slice(mac);
            out.extend_from_slice(&buf);
        }
        (KeyType::UnsignedLong, FieldValue::UInt(v)) => out.write_u64::<BigEndian>(*v)?,
        (KeyType::Float, FieldValue::Float(v)) => out.write_f32::<BigEndian>(*v as f32)?,
        (KeyType::Double, FieldValue::Float(v)) => out.write_f64::<BigEndian>(*v)?,
        (KeyType::HexBinary, FieldValue::Bytes(b)) => write_opaque(out, b)?,
        (KeyType::HexBinary, FieldValue::Ipv6(addr)) => write_opaque(out, &addr.octets())?,
        (KeyType::HexBinary, FieldValue::Ipv4(addr)) => write_opaque(out, &addr.octets())?,
        (KeyType::HexBinary, FieldValue::Uuid(id)) => write_opaque(out, id.as_bytes())?,
        (KeyType::String, FieldValue::Str(s)) => write_opaque(out, s.as_bytes())?,
        (KeyType::Boolean, FieldValue::Bool(b)) => out.write_u8(u8::from(*b))?,
        (KeyType::Byte, FieldValue::Int(v)) => {
            out.write_i8(i8::try_from(*v).map_err(|_| range())?)?
        }
        (KeyType::UnsignedByte, FieldValue::UInt(v)) => {
            out.write_u8(u8::try_from(*v).map_err(|_| range())?)?
        }
        (KeyType::Short, FieldValue::Int(v)) => {
            out.write_i16::<BigEndian>(i16::try_from(*v).map_err(|_| range())?)?
        }
        (KeyType::UnsignedShort, FieldValue::UInt(v)) => {
            out.write_u16::<BigEndian>(u16::try_from(*v).map_err(|_| range())?)?
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

impl RecordEncoder for FieldOrderEncoder {
    fn encode(&self, template: &TemplateSnapshot, record: &Record) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        for field in &template.fields {
            let value = record
                .get(field.key_id)
                .ok_or_else(|| EncodeError::MissingField {
                    key_id: field.key_id,
                    name: field.name.clone(),
                })?;
            encode_field(&mut out, &field.name, field.key_type, value)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::types::FieldDescriptor;
    use pretty_assertions::assert_eq;

    fn snapshot(fields: &[(u32, KeyType)]) -> TemplateSnapshot {
        TemplateSnapshot {
            id: 1,
            schema_name: "s".into(),
            type_name: "t".into(),
            fields: fields
                .iter()
                .map(|(id, ty)| FieldDescriptor {
                    key_id: *id,
                    name: format!("f{}", id),
                    key_type: *ty,
                })
                .collect(),
        }
    }

    #[test]
    fn test_encodes_in_field_order() {
        let snap = snapshot(&[
            (2, KeyType::String),
            (1, KeyType::UnsignedInt),
            (3, KeyType::Ipv4Addr),
        ]);
        let record = Record::new()
            .with(1, FieldValue::UInt(7))
            .with(2, FieldValue::Str("ab".into()))
            .with(3, FieldValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));

        let bytes = FieldOrderEncoder.encode(&snap, &record).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 2, b'a', b'b', 0, 0, 0, 7, 10, 0, 0, 1]
        );
    }

    #[test]
    fn test_mac_and_bool() {
        let snap = snapshot(&[(1, KeyType::MacAddress), (2, KeyType::Boolean)]);
        let record = Record::new()
            .with(1, FieldValue::Mac([1, 2, 3, 4, 5, 6]))
            .with(2, FieldValue::Bool(true));
        let bytes = FieldOrderEncoder.encode(&snap, &record).unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 2, 3, 4, 5, 6, 1]);
    }

    #[test]
    fn test_missing_field() {
        let snap = snapshot(&[(1, KeyType::Int)]);
        let err = FieldOrderEncoder.encode(&snap, &Record::new()).unwrap_err();
        assert!(matches!(err, EncodeError::MissingField { key_id: 1, .. }));
    }

    #[test]
    fn test_type_mismatch_and_range() {
        let snap = snapshot(&[(1, KeyType::UnsignedShort)]);
        let err = FieldOrderEncoder
            .encode(&snap, &Record::new().with(1, FieldValue::Str("x".into())))
            .unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { .. }));

        let err = FieldOrderEncoder
            .encode(&snap, &Record::new().with(1, FieldValue::UInt(70_000)))
            .unwrap_err();
        assert!(matches!(err, EncodeError::OutOfRange { .. }));
    }

    #[test]
    fn test_disabled_fields_are_not_required() {
        let snap = snapshot(&[]);
        let bytes = FieldOrderEncoder
            .encode(&snap, &Record::new().with(9, FieldValue::Int(1)))
            .unwrap();
        assert!(bytes.is_empty());
    }
}
