//! Collector and connection types.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::types::{CollectorId, ConnectionId, SessionId, TransportHandle};

/// Default IPDR/SP port.
pub const DEFAULT_COLLECTOR_PORT: u16 = 4737;

/// Description of a collector to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// Pool size. Zero makes the collector reactive-only.
    pub num_of_connections: u32,
}

impl CollectorConfig {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            num_of_connections: 1,
        }
    }

    pub fn with_connections(mut self, count: u32) -> Self {
        self.num_of_connections = count;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Public view of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub autoconnect: bool,
    pub direction: Direction,
    pub handle: Option<TransportHandle>,
    pub peer: Option<SocketAddr>,
    pub handshake_complete: bool,
}

/// Public view of a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorInfo {
    pub id: CollectorId,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub num_of_connections: u32,
    pub is_dummy: bool,
    pub connections: Vec<ConnectionInfo>,
    pub sessions: Vec<SessionId>,
}
