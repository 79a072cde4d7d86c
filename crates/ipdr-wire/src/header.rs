//! IPDR/SP message header.

use std::fmt;

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::reader::Reader;
use crate::{WireError, WireResult};

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 2;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest message (header included) the codec accepts.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

// version + message id + session id + flags + length
const _: () = assert!(HEADER_LEN == 1 + 1 + 1 + 1 + 4);

/// IPDR/SP message identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Collector asks the exporter to start a flow.
    FlowStart,
    /// Collector ends a flow.
    FlowStop,
    /// Connection handshake request.
    Connect,
    /// Connection handshake reply.
    ConnectResponse,
    /// Orderly connection teardown.
    Disconnect,
    /// Exporter starts a session on a collector.
    SessionStart,
    /// Exporter stops a session on a collector.
    SessionStop,
    /// One data record.
    Data,
    /// Acknowledgment of a DSN prefix.
    DataAck,
    /// Error report.
    Error,
    /// Keep-alive probe.
    KeepAlive,
}

impl MessageId {
    /// Returns the on-wire code for this message.
    pub fn code(&self) -> u8 {
        match self {
            Self::FlowStart => 0x01,
            Self::FlowStop => 0x03,
            Self::Connect => 0x05,
            Self::ConnectResponse => 0x06,
            Self::Disconnect => 0x07,
            Self::SessionStart => 0x08,
            Self::SessionStop => 0x09,
            Self::Data => 0x20,
            Self::DataAck => 0x21,
            Self::Error => 0x23,
            Self::KeepAlive => 0x40,
        }
    }

    /// Creates a message id from its on-wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::FlowStart),
            0x03 => Some(Self::FlowStop),
            0x05 => Some(Self::Connect),
            0x06 => Some(Self::ConnectResponse),
            0x07 => Some(Self::Disconnect),
            0x08 => Some(Self::SessionStart),
            0x09 => Some(Self::SessionStop),
            0x20 => Some(Self::Data),
            0x21 => Some(Self::DataAck),
            0x23 => Some(Self::Error),
            0x40 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    /// Returns the protocol name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlowStart => "FLOW_START",
            Self::FlowStop => "FLOW_STOP",
            Self::Connect => "CONNECT",
            Self::ConnectResponse => "CONNECT_RESPONSE",
            Self::Disconnect => "DISCONNECT",
            Self::SessionStart => "SESSION_START",
            Self::SessionStop => "SESSION_STOP",
            Self::Data => "DATA",
            Self::DataAck => "DATA_ACK",
            Self::Error => "ERROR",
            Self::KeepAlive => "KEEP_ALIVE",
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Fixed header preceding every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Protocol version.
    pub version: u8,
    /// Message type.
    pub message_id: MessageId,
    /// Session the message belongs to (0 for connection-level messages).
    pub session_id: u8,
    /// Message-level flags.
    pub flags: u8,
    /// Total message length including the header.
    pub length: u32,
}

impl MessageHeader {
    /// Creates a header for a body of `body_len` bytes.
    pub fn new(message_id: MessageId, session_id: u8, body_len: usize) -> WireResult<Self> {
        let total = HEADER_LEN + body_len;
        if total > MAX_MESSAGE_LEN {
            return Err(WireError::TooLarge(total));
        }
        Ok(Self {
            version: PROTOCOL_VERSION,
            message_id,
            session_id,
            flags: 0,
            length: total as u32,
        })
    }

    /// Length of the body that follows the header.
    pub fn body_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }

    /// Appends the encoded header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> WireResult<()> {
        out.write_u8(self.version)?;
        out.write_u8(self.message_id.code())?;
        out.write_u8(self.session_id)?;
        out.write_u8(self.flags)?;
        out.write_u32::<BigEndian>(self.length)?;
        Ok(())
    }

    /// Decodes and validates a header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(buf);
        let version = r.u8()?;
        let code = r.u8()?;
        let session_id = r.u8()?;
        let flags = r.u8()?;
        let length = r.u32()?;

        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let message_id = MessageId::from_code(code).ok_or(WireError::UnknownMessageId(code))?;
        if (length as usize) < HEADER_LEN {
            return Err(WireError::InvalidLength(length));
        }
        if length as usize > MAX_MESSAGE_LEN {
            return Err(WireError::TooLarge(length as usize));
        }

        Ok(Self {
            version,
            message_id,
            session_id,
            flags,
            length,
        })
    }

    /// Returns the total frame length announced by a buffered header, if a
    /// full header is available.
    pub fn peek_frame_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize)
    }
}
