//! UDP protocol-info discovery.
//!
//! A collector probes an exporter with a 12-byte version request; the exporter
//! answers with a fixed 28-byte response advertising the transport, protocol
//! version and TCP port it listens on.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::reader::Reader;
use crate::{WireError, WireResult};

/// Magic carried by every discovery message.
pub const DISCOVERY_MAGIC: [u8; 4] = *b"IPDR";

/// Encoded request length.
pub const VERSION_REQUEST_LEN: usize = 12;

/// Encoded response length.
pub const VERSION_RESPONSE_LEN: usize = 28;

const _: () = assert!(VERSION_REQUEST_LEN == 4 + 4 + 4);
const _: () = assert!(VERSION_RESPONSE_LEN == 4 + 4 + 4 + 4 + 4 + 4 + 2 + 2);

/// Transport advertised in a discovery response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Tcp,
}

impl TransportType {
    pub fn code(&self) -> u32 {
        match self {
            Self::Tcp => 1,
        }
    }

    pub fn from_code(code: u32) -> WireResult<Self> {
        match code {
            1 => Ok(Self::Tcp),
            other => Err(WireError::UnknownTransport(other)),
        }
    }
}

/// Request sent by a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRequest {
    pub requester_address: Ipv4Addr,
    pub requester_boot_time: u32,
}

impl VersionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VERSION_REQUEST_LEN);
        out.extend_from_slice(&u32::from(self.requester_address).to_be_bytes());
        out.extend_from_slice(&self.requester_boot_time.to_be_bytes());
        out.extend_from_slice(&DISCOVERY_MAGIC);
        out
    }

    /// Decodes a request, rejecting datagrams without the `"IPDR"` magic.
    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(buf);
        let requester_address = Ipv4Addr::from(r.u32()?);
        let requester_boot_time = r.u32()?;
        if r.array::<4>()? != DISCOVERY_MAGIC {
            return Err(WireError::BadMagic);
        }
        Ok(Self {
            requester_address,
            requester_boot_time,
        })
    }
}

/// The single protocol entry advertised by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub transport: TransportType,
    pub protocol_version: u32,
    pub port: u16,
}

/// Response sent by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    /// Echo of the requester address.
    pub requester_address: Ipv4Addr,
    pub exporter_boot_time: u32,
    pub protocol: ProtocolInfo,
}

impl VersionResponse {
    /// Builds the answer to `request`.
    pub fn answer(request: &VersionRequest, exporter_boot_time: u32, port: u16) -> Self {
        Self {
            requester_address: request.requester_address,
            exporter_boot_time,
            protocol: ProtocolInfo {
                transport: TransportType::Tcp,
                protocol_version: u32::from(crate::PROTOCOL_VERSION),
                port,
            },
        }
    }

    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut out = Vec::with_capacity(VERSION_RESPONSE_LEN);
        out.write_u32::<BigEndian>(u32::from(self.requester_address))?;
        out.write_u32::<BigEndian>(self.exporter_boot_time)?;
        out.extend_from_slice(&DISCOVERY_MAGIC);
        // protocol count
        out.write_u32::<BigEndian>(1)?;
        out.write_u32::<BigEndian>(self.protocol.transport.code())?;
        out.write_u32::<BigEndian>(self.protocol.protocol_version)?;
        out.write_u16::<BigEndian>(self.protocol.port)?;
        // reserved
        out.write_u16::<BigEndian>(0)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(buf);
        let requester_address = Ipv4Addr::from(r.u32()?);
        let exporter_boot_time = r.u32()?;
        if r.array::<4>()? != DISCOVERY_MAGIC {
            return Err(WireError::BadMagic);
        }
        let _count = r.u32()?;
        let transport = TransportType::from_code(r.u32()?)?;
        let protocol_version = r.u32()?;
        let port = r.u16()?;
        let _reserved = r.u16()?;
        Ok(Self {
            requester_address,
            exporter_boot_time,
            protocol: ProtocolInfo {
                transport,
                protocol_version,
                port,
            },
        })
    }
}
