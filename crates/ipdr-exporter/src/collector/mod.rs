//! Collectors and their connection pools.
//!
//! A configured collector pre-creates `num_of_connections` outbound pooled
//! connections that the autoconnect timer dials. A dummy collector is
//! materialized when an unknown peer connects inbound; it is never dialed.

mod types;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use crate::timer::TimerId;
use crate::types::{CollectorId, CollectorSessionId, ConnectionId, TransportHandle};

pub use types::{
    CollectorConfig, CollectorInfo, ConnectionInfo, ConnectionState, Direction,
    DEFAULT_COLLECTOR_PORT,
};

/// One IPDR connection owned by a collector.
#[derive(Debug, Clone)]
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) state: ConnectionState,
    pub(crate) autoconnect: bool,
    pub(crate) direction: Direction,
    pub(crate) handle: Option<TransportHandle>,
    pub(crate) peer: Option<SocketAddr>,
    /// CONNECT / CONNECT_RESPONSE exchange finished.
    pub(crate) handshake_complete: bool,
    pub(crate) keep_alive_out: Option<TimerId>,
    pub(crate) keep_alive_in: Option<TimerId>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, direction: Direction, autoconnect: bool) -> Self {
        Self {
            id,
            state: ConnectionState::Disconnected,
            autoconnect,
            direction,
            handle: None,
            peer: None,
            handshake_complete: false,
            keep_alive_out: None,
            keep_alive_in: None,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Returns the connection to `Disconnected`, yielding its timers.
    pub(crate) fn reset(&mut self) -> Vec<TimerId> {
        self.state = ConnectionState::Disconnected;
        self.handle = None;
        self.handshake_complete = false;
        self.keep_alive_out
            .take()
            .into_iter()
            .chain(self.keep_alive_in.take())
            .collect()
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state,
            autoconnect: self.autoconnect,
            direction: self.direction,
            handle: self.handle,
            peer: self.peer,
            handshake_complete: self.handshake_complete,
        }
    }
}

/// A peer that receives records.
#[derive(Debug, Clone)]
pub(crate) struct Collector {
    pub(crate) id: CollectorId,
    pub(crate) name: String,
    pub(crate) address: IpAddr,
    pub(crate) port: u16,
    pub(crate) num_of_connections: u32,
    pub(crate) is_dummy: bool,
    pub(crate) connections: BTreeMap<ConnectionId, Connection>,
    pub(crate) collector_sessions: Vec<CollectorSessionId>,
}

impl Collector {
    pub(crate) fn configured(id: CollectorId, config: &CollectorConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            address: config.address,
            port: config.port,
            num_of_connections: config.num_of_connections,
            is_dummy: false,
            connections: BTreeMap::new(),
            collector_sessions: Vec::new(),
        }
    }

    pub(crate) fn dummy(id: CollectorId, peer: SocketAddr) -> Self {
        Self {
            id,
            name: format!("dummy-{}", peer),
            address: peer.ip(),
            port: peer.port(),
            num_of_connections: 0,
            is_dummy: true,
            connections: BTreeMap::new(),
            collector_sessions: Vec::new(),
        }
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Adds a connection to the pool. Autoconnect follows the pool size.
    pub(crate) fn add_connection(&mut self, id: ConnectionId, direction: Direction) -> &mut Connection {
        let autoconnect = self.num_of_connections > 0 && !self.is_dummy;
        self.connections
            .entry(id)
            .or_insert_with(|| Connection::new(id, direction, autoconnect))
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub(crate) fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// First connection that is connected and finished its handshake.
    pub(crate) fn ready_connection(&self) -> Option<&Connection> {
        self.connections
            .values()
            .find(|c| c.is_connected() && c.handshake_complete)
    }

    pub(crate) fn has_connected(&self) -> bool {
        self.connections.values().any(Connection::is_connected)
    }

    /// A disconnected pooled slot an inbound connection can take over.
    pub(crate) fn idle_slot(&self) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| c.state == ConnectionState::Disconnected)
            .map(|c| c.id)
    }

    pub(crate) fn matches_peer(&self, peer: SocketAddr) -> bool {
        // Collectors dial from ephemeral ports, so only the address is compared.
        self.address == peer.ip()
    }

    pub(crate) fn info(&self, sessions: Vec<crate::types::SessionId>) -> CollectorInfo {
        CollectorInfo {
            id: self.id,
            name: self.name.clone(),
            address: self.address,
            port: self.port,
            num_of_connections: self.num_of_connections,
            is_dummy: self.is_dummy,
            connections: self.connections.values().map(Connection::info).collect(),
            sessions,
        }
    }
}
