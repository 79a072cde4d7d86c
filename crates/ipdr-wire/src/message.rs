//! IPDR/SP message bodies.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::header::{MessageHeader, MessageId, HEADER_LEN};
use crate::reader::Reader;
use crate::{WireError, WireResult};

/// Flags carried by DATA messages.
pub mod data_flags {
    /// The record is a retransmission of a previously sent DSN.
    pub const DUPLICATE: u8 = 0x01;
    /// Historical synchronization marker; never set by this exporter.
    pub const LEGACY_SYNC: u8 = 0x02;
}

/// Capability bits exchanged in CONNECT / CONNECT_RESPONSE.
pub mod capabilities {
    /// Structured (nested) record types.
    pub const STRUCTURES: u32 = 0x01;
    /// Several sessions over one connection.
    pub const MULTISESSION: u32 = 0x02;
    /// Collector-driven template negotiation.
    pub const TEMPLATE_NEGOTIATION: u32 = 0x04;
}

/// One data record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Template the record was built from.
    pub template_id: u16,
    /// Configuration the template belongs to.
    pub config_id: u16,
    /// DATA flags (see [`data_flags`]).
    pub flags: u8,
    /// Per-session data sequence number.
    pub sequence: u64,
    /// Encoded record.
    pub payload: Vec<u8>,
}

impl DataMessage {
    /// Bytes preceding the payload in a DATA body.
    pub const FIXED_LEN: usize = 2 + 2 + 1 + 8 + 4;

    /// Returns true if the record is marked as a retransmission.
    pub fn is_duplicate(&self) -> bool {
        self.flags & data_flags::DUPLICATE != 0
    }
}

/// Acknowledgment of every DSN up to and including `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAck {
    /// Configuration of the acknowledged record.
    pub config_id: u16,
    /// Highest acknowledged DSN.
    pub sequence: u64,
}

/// Connection handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    /// Address of the initiating side.
    pub initiator_address: Ipv4Addr,
    /// Port of the initiating side.
    pub initiator_port: u16,
    /// Capability bits (see [`capabilities`]).
    pub capabilities: u32,
    /// Keep-alive interval in seconds.
    pub keep_alive_interval: u32,
    /// Vendor identification string.
    pub vendor_id: String,
}

/// Connection handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Capability bits accepted by the peer.
    pub capabilities: u32,
    /// Keep-alive interval in seconds.
    pub keep_alive_interval: u32,
    /// Vendor identification string.
    pub vendor_id: String,
}

/// Exporter announces a session start on a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    /// Exporter boot time (seconds since the epoch).
    pub exporter_boot_time: u32,
    /// DSN of the first record that will follow.
    pub first_record_sequence: u64,
    /// Records dropped before this session start.
    pub dropped_record_count: u64,
    /// True if this collector is the primary for the session.
    pub primary: bool,
    /// Acknowledgment time interval in milliseconds.
    pub ack_time_interval: u32,
    /// Acknowledgment window in records.
    pub ack_sequence_interval: u32,
    /// Document identifier of the session.
    pub document_id: [u8; 16],
}

/// Why a session was stopped on a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStopReason {
    /// The exporter has no more data for the session.
    EndOfData,
    /// The session moves to a collector with a better priority.
    HandingOver,
    /// The session was administratively deactivated.
    Deactivated,
    /// Templates changed and will be re-announced.
    TemplatesUpdated,
    /// Any other code.
    Other(u16),
}

impl SessionStopReason {
    /// Returns the on-wire reason code.
    pub fn code(&self) -> u16 {
        match self {
            Self::EndOfData => 0,
            Self::HandingOver => 1,
            Self::Deactivated => 2,
            Self::TemplatesUpdated => 3,
            Self::Other(code) => *code,
        }
    }

    /// Creates a reason from its on-wire code.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::EndOfData,
            1 => Self::HandingOver,
            2 => Self::Deactivated,
            3 => Self::TemplatesUpdated,
            other => Self::Other(other),
        }
    }
}

/// Exporter stops a session on a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStop {
    /// Stop reason.
    pub reason: SessionStopReason,
    /// Free-form reason text.
    pub info: String,
}

/// Collector stops a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStop {
    /// Stop reason code.
    pub reason_code: u16,
    /// Free-form reason text.
    pub info: String,
}

/// Error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Seconds since the epoch.
    pub timestamp: u32,
    /// Error code.
    pub code: u16,
    /// Human-readable description.
    pub description: String,
}

/// A decoded IPDR/SP message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    FlowStart,
    FlowStop(FlowStop),
    Connect(Connect),
    ConnectResponse(ConnectResponse),
    Disconnect,
    SessionStart(SessionStart),
    SessionStop(SessionStop),
    Data(DataMessage),
    DataAck(DataAck),
    Error(ErrorMessage),
    KeepAlive,
}

fn write_string(out: &mut Vec<u8>, s: &str) -> WireResult<()> {
    out.write_u32::<BigEndian>(s.len() as u32)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

impl Message {
    /// Returns the message id of this message.
    pub fn id(&self) -> MessageId {
        match self {
            Self::FlowStart => MessageId::FlowStart,
            Self::FlowStop(_) => MessageId::FlowStop,
            Self::Connect(_) => MessageId::Connect,
            Self::ConnectResponse(_) => MessageId::ConnectResponse,
            Self::Disconnect => MessageId::Disconnect,
            Self::SessionStart(_) => MessageId::SessionStart,
            Self::SessionStop(_) => MessageId::SessionStop,
            Self::Data(_) => MessageId::Data,
            Self::DataAck(_) => MessageId::DataAck,
            Self::Error(_) => MessageId::Error,
            Self::KeepAlive => MessageId::KeepAlive,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> WireResult<()> {
        match self {
            Self::FlowStart | Self::Disconnect | Self::KeepAlive => {}
            Self::FlowStop(m) => {
                out.write_u16::<BigEndian>(m.reason_code)?;
                write_string(out, &m.info)?;
            }
            Self::Connect(m) => {
                out.write_u32::<BigEndian>(u32::from(m.initiator_address))?;
                out.write_u16::<BigEndian>(m.initiator_port)?;
                out.write_u32::<BigEndian>(m.capabilities)?;
                out.write_u32::<BigEndian>(m.keep_alive_interval)?;
                write_string(out, &m.vendor_id)?;
            }
            Self::ConnectResponse(m) => {
                out.write_u32::<BigEndian>(m.capabilities)?;
                out.write_u32::<BigEndian>(m.keep_alive_interval)?;
                write_string(out, &m.vendor_id)?;
            }
            Self::SessionStart(m) => {
                out.write_u32::<BigEndian>(m.exporter_boot_time)?;
                out.write_u64::<BigEndian>(m.first_record_sequence)?;
                out.write_u64::<BigEndian>(m.dropped_record_count)?;
                out.write_u8(u8::from(m.primary))?;
                out.write_u32::<BigEndian>(m.ack_time_interval)?;
                out.write_u32::<BigEndian>(m.ack_sequence_interval)?;
                out.extend_from_slice(&m.document_id);
            }
            Self::SessionStop(m) => {
                out.write_u16::<BigEndian>(m.reason.code())?;
                write_string(out, &m.info)?;
            }
            Self::Data(m) => {
                out.write_u16::<BigEndian>(m.template_id)?;
                out.write_u16::<BigEndian>(m.config_id)?;
                out.write_u8(m.flags)?;
                out.write_u64::<BigEndian>(m.sequence)?;
                out.write_u32::<BigEndian>(m.payload.len() as u32)?;
                out.extend_from_slice(&m.payload);
            }
            Self::DataAck(m) => {
                out.write_u16::<BigEndian>(m.config_id)?;
                out.write_u64::<BigEndian>(m.sequence)?;
            }
            Self::Error(m) => {
                out.write_u32::<BigEndian>(m.timestamp)?;
                out.write_u16::<BigEndian>(m.code)?;
                write_string(out, &m.description)?;
            }
        }
        Ok(())
    }

    /// Encodes the message with its header for `session_id`.
    pub fn encode(&self, session_id: u8) -> WireResult<Vec<u8>> {
        let mut body = Vec::new();
        self.encode_body(&mut body)?;

        let header = MessageHeader::new(self.id(), session_id, body.len())?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        header.encode_into(&mut out)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes one complete frame (header and body).
    pub fn decode(frame: &[u8]) -> WireResult<(MessageHeader, Message)> {
        let header = MessageHeader::decode(frame)?;
        if frame.len() < header.length as usize {
            return Err(WireError::Truncated {
                need: header.length as usize,
                got: frame.len(),
            });
        }

        let mut r = Reader::new(&frame[HEADER_LEN..header.length as usize]);
        let message = match header.message_id {
            MessageId::FlowStart => Self::FlowStart,
            MessageId::Disconnect => Self::Disconnect,
            MessageId::KeepAlive => Self::KeepAlive,
            MessageId::FlowStop => Self::FlowStop(FlowStop {
                reason_code: r.u16()?,
                info: r.string()?,
            }),
            MessageId::Connect => Self::Connect(Connect {
                initiator_address: Ipv4Addr::from(r.u32()?),
                initiator_port: r.u16()?,
                capabilities: r.u32()?,
                keep_alive_interval: r.u32()?,
                vendor_id: r.string()?,
            }),
            MessageId::ConnectResponse => Self::ConnectResponse(ConnectResponse {
                capabilities: r.u32()?,
                keep_alive_interval: r.u32()?,
                vendor_id: r.string()?,
            }),
            MessageId::SessionStart => Self::SessionStart(SessionStart {
                exporter_boot_time: r.u32()?,
                first_record_sequence: r.u64()?,
                dropped_record_count: r.u64()?,
                primary: r.u8()? != 0,
                ack_time_interval: r.u32()?,
                ack_sequence_interval: r.u32()?,
                document_id: r.array::<16>()?,
            }),
            MessageId::SessionStop => Self::SessionStop(SessionStop {
                reason: SessionStopReason::from_code(r.u16()?),
                info: r.string()?,
            }),
            MessageId::Data => Self::Data(DataMessage {
                template_id: r.u16()?,
                config_id: r.u16()?,
                flags: r.u8()?,
                sequence: r.u64()?,
                payload: r.opaque()?,
            }),
            MessageId::DataAck => Self::DataAck(DataAck {
                config_id: r.u16()?,
                sequence: r.u64()?,
            }),
            MessageId::Error => Self::Error(ErrorMessage {
                timestamp: r.u32()?,
                code: r.u16()?,
                description: r.string()?,
            }),
        };

        Ok((header, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_data_message_layout() {
        let msg = Message::Data(DataMessage {
            template_id: 0x0102,
            config_id: 0x0304,
            flags: data_flags::DUPLICATE,
            sequence: 0x0506070809,
            payload: vec![0xaa, 0xbb],
        });

        let bytes = msg.encode(3).unwrap();
        assert_eq!(
            bytes,
            vec![
                2, 0x20, 3, 0, 0, 0, 0, 27, // header
                0x01, 0x02, // template id
                0x03, 0x04, // config id
                0x01, // flags
                0, 0, 0, 0x05, 0x06, 0x07, 0x08, 0x09, // sequence
                0, 0, 0, 2, // payload length
                0xaa, 0xbb,
            ]
        );
        assert_eq!(bytes.len(), HEADER_LEN + DataMessage::FIXED_LEN + 2);
    }

    #[test]
    fn test_data_message_decode() {
        let data = DataMessage {
            template_id: 9,
            config_id: 1,
            flags: 0,
            sequence: 42,
            payload: b"record".to_vec(),
        };
        let bytes = Message::Data(data.clone()).encode(1).unwrap();

        let (header, decoded) = Message::decode(&bytes).unwrap();
        assert_eq!(header.session_id, 1);
        assert_eq!(header.message_id, MessageId::Data);
        assert_eq!(decoded, Message::Data(data));
    }

    #[test]
    fn test_session_start_decode() {
        let start = SessionStart {
            exporter_boot_time: 1_700_000_000,
            first_record_sequence: 17,
            dropped_record_count: 0,
            primary: true,
            ack_time_interval: 5000,
            ack_sequence_interval: 128,
            document_id: [7u8; 16],
        };
        let bytes = Message::SessionStart(start.clone()).encode(4).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 4 + 8 + 8 + 1 + 4 + 4 + 16);

        let (_, decoded) = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, Message::SessionStart(start));
    }

    #[test]
    fn test_connect_carries_vendor_string() {
        let connect = Connect {
            initiator_address: Ipv4Addr::new(10, 0, 0, 1),
            initiator_port: 4737,
            capabilities: capabilities::MULTISESSION | capabilities::TEMPLATE_NEGOTIATION,
            keep_alive_interval: 30,
            vendor_id: "ipdr-exporter".to_string(),
        };
        let bytes = Message::Connect(connect.clone()).encode(0).unwrap();
        let (_, decoded) = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, Message::Connect(connect));
    }

    #[test]
    fn test_session_stop_reason_codes() {
        assert_eq!(SessionStopReason::from_code(1), SessionStopReason::HandingOver);
        assert_eq!(SessionStopReason::from_code(77), SessionStopReason::Other(77));
        assert_eq!(SessionStopReason::Other(77).code(), 77);
    }

    #[test]
    fn test_decode_truncated_body() {
        let mut bytes = Message::DataAck(DataAck {
            config_id: 1,
            sequence: 5,
        })
        .encode(1)
        .unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_empty_bodies() {
        let bytes = Message::KeepAlive.encode(0).unwrap();
        assert_eq!(bytes, vec![2, 0x40, 0, 0, 0, 0, 0, 8]);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }
}
