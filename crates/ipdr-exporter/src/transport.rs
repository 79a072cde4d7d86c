//! Transport boundary.
//!
//! The core calls the transport while holding the exporter lock, so every
//! method must return without blocking: `dial` only starts a connection
//! attempt and the outcome is reported later through
//! `Exporter::connection_established` / `Exporter::connection_failed`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use ipdr_wire::{Message, MessageHeader};
use parking_lot::Mutex;
use thiserror::Error;

use crate::types::TransportHandle;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Operation not supported by this transport: {0}")]
    Unsupported(&'static str),

    #[error("Unknown transport handle: {0}")]
    UnknownHandle(TransportHandle),

    #[error("Connection {0} is closed")]
    Closed(TransportHandle),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Encoding failed: {0}")]
    Wire(#[from] ipdr_wire::WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket mechanics used by the exporter core.
pub trait Transport: Send + Sync {
    /// Starts accepting inbound connections on `addr`.
    fn listen(&self, _addr: SocketAddr) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("listen"))
    }

    fn stop_listening(&self) {}

    /// Starts an outbound connection attempt.
    fn dial(&self, addr: SocketAddr) -> Result<TransportHandle, TransportError>;

    /// Queues one encoded frame for transmission.
    fn send(&self, handle: TransportHandle, frame: Vec<u8>) -> Result<(), TransportError>;

    fn close(&self, handle: TransportHandle);
}

#[derive(Debug, Default)]
struct MemoryState {
    next_handle: u64,
    listening: Option<SocketAddr>,
    dialed: Vec<(TransportHandle, SocketAddr)>,
    open: BTreeSet<TransportHandle>,
    sent: BTreeMap<TransportHandle, Vec<Vec<u8>>>,
    closed: Vec<TransportHandle>,
    fail_dial: bool,
    fail_send: bool,
}

/// Transport that records every call instead of touching the network.
///
/// Useful for embedding the core behind a custom event loop and for tests:
/// connection outcomes are injected by calling the exporter's
/// protocol-facing operations with the handles this transport hands out.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    supports_listen: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            supports_listen: true,
        }
    }

    /// A transport whose `listen` reports `Unsupported`.
    pub fn without_listen() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            supports_listen: false,
        }
    }

    /// Allocates a handle as if a peer had connected inbound.
    pub fn accept(&self) -> TransportHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = TransportHandle(state.next_handle);
        state.open.insert(handle);
        handle
    }

    pub fn listening(&self) -> Option<SocketAddr> {
        self.state.lock().listening
    }

    pub fn dialed(&self) -> Vec<(TransportHandle, SocketAddr)> {
        self.state.lock().dialed.clone()
    }

    /// Handle of the most recent dial to `addr`.
    pub fn last_dial_to(&self, addr: SocketAddr) -> Option<TransportHandle> {
        self.state
            .lock()
            .dialed
            .iter()
            .rev()
            .find(|(_, a)| *a == addr)
            .map(|(h, _)| *h)
    }

    pub fn closed(&self) -> Vec<TransportHandle> {
        self.state.lock().closed.clone()
    }

    pub fn is_open(&self, handle: TransportHandle) -> bool {
        self.state.lock().open.contains(&handle)
    }

    pub fn set_fail_dial(&self, fail: bool) {
        self.state.lock().fail_dial = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state.lock().fail_send = fail;
    }

    /// Raw frames sent on `handle`.
    pub fn sent_frames(&self, handle: TransportHandle) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sent
            .get(&handle)
            .cloned()
            .unwrap_or_default()
    }

    /// Decoded messages sent on `handle`. Frames that fail to decode are
    /// skipped.
    pub fn sent_messages(&self, handle: TransportHandle) -> Vec<(MessageHeader, Message)> {
        self.sent_frames(handle)
            .iter()
            .filter_map(|frame| Message::decode(frame).ok())
            .collect()
    }

    /// Drains and decodes everything sent on `handle`.
    pub fn take_messages(&self, handle: TransportHandle) -> Vec<(MessageHeader, Message)> {
        let frames = self
            .state
            .lock()
            .sent
            .remove(&handle)
            .unwrap_or_default();
        frames
            .iter()
            .filter_map(|frame| Message::decode(frame).ok())
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn listen(&self, addr: SocketAddr) -> Result<(), TransportError> {
        if !self.supports_listen {
            return Err(TransportError::Unsupported("listen"));
        }
        self.state.lock().listening = Some(addr);
        Ok(())
    }

    fn stop_listening(&self) {
        self.state.lock().listening = None;
    }

    fn dial(&self, addr: SocketAddr) -> Result<TransportHandle, TransportError> {
        let mut state = self.state.lock();
        if state.fail_dial {
            return Err(TransportError::Refused(addr.to_string()));
        }
        state.next_handle += 1;
        let handle = TransportHandle(state.next_handle);
        state.dialed.push((handle, addr));
        state.open.insert(handle);
        Ok(handle)
    }

    fn send(&self, handle: TransportHandle, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open.contains(&handle) {
            return Err(TransportError::Closed(handle));
        }
        if state.fail_send {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "send failed",
            )));
        }
        state.sent.entry(handle).or_default().push(frame);
        Ok(())
    }

    fn close(&self, handle: TransportHandle) {
        let mut state = self.state.lock();
        if state.open.remove(&handle) {
            state.closed.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_memory_transport_records_calls() {
        let transport = MemoryTransport::new();
        let addr: SocketAddr = "10.0.0.1:4737".parse().unwrap();

        let handle = transport.dial(addr).unwrap();
        assert_eq!(transport.last_dial_to(addr), Some(handle));

        let frame = Message::KeepAlive.encode(0).unwrap();
        transport.send(handle, frame.clone()).unwrap();
        assert_eq!(transport.sent_frames(handle), vec![frame]);
        assert_eq!(transport.sent_messages(handle)[0].1, Message::KeepAlive);

        transport.close(handle);
        assert!(!transport.is_open(handle));
        assert!(matches!(
            transport.send(handle, Vec::new()),
            Err(TransportError::Closed(_))
        ));
        assert_eq!(transport.closed(), vec![handle]);
    }

    #[test]
    fn test_failure_injection() {
        let transport = MemoryTransport::without_listen();
        assert!(matches!(
            transport.listen("0.0.0.0:4737".parse().unwrap()),
            Err(TransportError::Unsupported(_))
        ));

        transport.set_fail_dial(true);
        assert!(transport.dial("10.0.0.1:1".parse().unwrap()).is_err());

        let handle = transport.accept();
        transport.set_fail_send(true);
        assert!(transport.send(handle, vec![1]).is_err());
    }
}
