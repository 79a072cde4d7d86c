//! TCP transport on tokio.
//!
//! Every method returns without blocking: binding happens synchronously on a
//! non-blocking std listener, dials run in spawned tasks, and frames are
//! handed to a per-connection task over an unbounded channel. Outcomes are
//! reported as [`TransportEvent`]s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipdr_wire::{MessageHeader, WireError, HEADER_LEN, MAX_MESSAGE_LEN};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::DisconnectReason;
use crate::transport::{Transport, TransportError};
use crate::types::TransportHandle;

const READ_CHUNK: usize = 16 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket activity reported to the driver.
#[derive(Debug)]
pub enum TransportEvent {
    /// A collector connected to our listener.
    Accepted { handle: TransportHandle, peer: SocketAddr },
    /// An outbound dial succeeded.
    Connected { handle: TransportHandle, peer: SocketAddr },
    /// An outbound dial failed.
    ConnectFailed { handle: TransportHandle, error: String },
    /// One complete IPDR frame.
    Frame { handle: TransportHandle, frame: Vec<u8> },
    /// The peer closed the connection or it broke. Not reported for
    /// connections closed through [`Transport::close`].
    Closed { handle: TransportHandle, reason: DisconnectReason },
}

type Connections = Arc<Mutex<HashMap<TransportHandle, mpsc::UnboundedSender<Vec<u8>>>>>;

pub struct TcpTransport {
    runtime: Handle,
    events: mpsc::UnboundedSender<TransportEvent>,
    next_handle: Arc<AtomicU64>,
    connections: Connections,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl TcpTransport {
    /// Creates a transport spawning onto `runtime`, and the receiver of its
    /// events.
    pub fn new(runtime: Handle) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            runtime,
            events,
            next_handle: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
        });
        (transport, rx)
    }

    fn allocate(next: &AtomicU64) -> TransportHandle {
        TransportHandle(next.fetch_add(1, Ordering::Relaxed))
    }

    fn register(connections: &Connections, handle: TransportHandle) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        connections.lock().insert(handle, tx);
        rx
    }
}

impl Transport for TcpTransport {
    fn listen(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        info!(%addr, "TCP listener bound");

        let events = self.events.clone();
        let connections = Arc::clone(&self.connections);
        let next_handle = Arc::clone(&self.next_handle);
        let task = self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let handle = Self::allocate(&next_handle);
                        let frames = Self::register(&connections, handle);
                        if events.send(TransportEvent::Accepted { handle, peer }).is_err() {
                            break;
                        }
                        tokio::spawn(run_connection(
                            handle,
                            stream,
                            frames,
                            Arc::clone(&connections),
                            events.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        if let Some(previous) = self.listener.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_listening(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
            debug!("TCP listener stopped");
        }
    }

    fn dial(&self, addr: SocketAddr) -> Result<TransportHandle, TransportError> {
        let handle = Self::allocate(&self.next_handle);
        let frames = Self::register(&self.connections, handle);
        let events = self.events.clone();
        let connections = Arc::clone(&self.connections);
        self.runtime.spawn(async move {
            let attempt = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    connections.lock().remove(&handle);
                    let _ = events.send(TransportEvent::ConnectFailed {
                        handle,
                        error: e.to_string(),
                    });
                    return;
                }
                Err(_) => {
                    connections.lock().remove(&handle);
                    let _ = events.send(TransportEvent::ConnectFailed {
                        handle,
                        error: "connect timed out".to_string(),
                    });
                    return;
                }
            };
            if !connections.lock().contains_key(&handle) {
                // Closed while dialing.
                return;
            }
            let peer = stream.peer_addr().unwrap_or(addr);
            let _ = events.send(TransportEvent::Connected { handle, peer });
            run_connection(handle, stream, frames, connections, events).await;
        });
        Ok(handle)
    }

    fn send(&self, handle: TransportHandle, frame: Vec<u8>) -> Result<(), TransportError> {
        let connections = self.connections.lock();
        let tx = connections
            .get(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        tx.send(frame).map_err(|_| TransportError::Closed(handle))
    }

    fn close(&self, handle: TransportHandle) {
        // Dropping the sender ends the connection task.
        if self.connections.lock().remove(&handle).is_some() {
            debug!(%handle, "connection closed locally");
        }
    }
}

/// Moves every complete frame out of `buf`. Fails on a header announcing an
/// impossible length.
pub fn split_frames(buf: &mut Vec<u8>) -> Result<Vec<Vec<u8>>, WireError> {
    let mut frames = Vec::new();
    while let Some(len) = MessageHeader::peek_frame_len(buf) {
        if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(WireError::InvalidLength(u32::try_from(len).unwrap_or(u32::MAX)));
        }
        if buf.len() < len {
            break;
        }
        frames.push(buf.drain(..len).collect());
    }
    Ok(frames)
}

async fn run_connection(
    handle: TransportHandle,
    stream: TcpStream,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    connections: Connections,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%handle, error = %e, "failed to set TCP_NODELAY");
    }
    let (mut reader, mut writer) = stream.into_split();
    let mut pending = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = loop {
        tokio::select! {
            outgoing = frames.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!(%handle, error = %e, "write failed");
                        break DisconnectReason::Tcp;
                    }
                }
                None => break DisconnectReason::Stop,
            },
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break DisconnectReason::Tcp,
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    match split_frames(&mut pending) {
                        Ok(complete) => {
                            for frame in complete {
                                let _ = events.send(TransportEvent::Frame { handle, frame });
                            }
                        }
                        Err(e) => {
                            warn!(%handle, error = %e, "malformed frame; dropping connection");
                            break DisconnectReason::Tcp;
                        }
                    }
                }
                Err(e) => {
                    debug!(%handle, error = %e, "read failed");
                    break DisconnectReason::Tcp;
                }
            },
        }
    };

    let _ = writer.shutdown().await;
    if connections.lock().remove(&handle).is_some() {
        let _ = events.send(TransportEvent::Closed { handle, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipdr_wire::Message;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_frames_keeps_partial_tail() {
        let first = Message::KeepAlive.encode(0).unwrap();
        let second = Message::Disconnect.encode(0).unwrap();
        let mut buf = first.clone();
        buf.extend_from_slice(&second[..3]);

        let frames = split_frames(&mut buf).unwrap();
        assert_eq!(frames, vec![first]);
        assert_eq!(buf, second[..3].to_vec());

        buf.extend_from_slice(&second[3..]);
        assert_eq!(split_frames(&mut buf).unwrap(), vec![second]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_frames_rejects_short_length() {
        let mut buf = vec![2, 0x40, 0, 0, 0, 0, 0, 4];
        assert!(split_frames(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_accept_and_receive_frame() {
        let (transport, mut events) = TcpTransport::new(Handle::current());
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        transport.listen(addr).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let handle = match events.recv().await.unwrap() {
            TransportEvent::Accepted { handle, .. } => handle,
            other => panic!("unexpected event {:?}", other),
        };

        client
            .write_all(&Message::KeepAlive.encode(0).unwrap())
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::Frame { handle: h, frame } => {
                assert_eq!(h, handle);
                assert_eq!(frame, Message::KeepAlive.encode(0).unwrap());
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(client);
        match events.recv().await.unwrap() {
            TransportEvent::Closed { handle: h, reason } => {
                assert_eq!(h, handle);
                assert_eq!(reason, DisconnectReason::Tcp);
            }
            other => panic!("unexpected event {:?}", other),
        }
        transport.stop_listening();
    }

    #[tokio::test]
    async fn test_dial_refused_reports_failure() {
        let (transport, mut events) = TcpTransport::new(Handle::current());
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let handle = transport.dial(addr).unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::ConnectFailed { handle: h, .. } => assert_eq!(h, handle),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            transport.send(handle, vec![0]),
            Err(TransportError::UnknownHandle(_))
        ));
    }
}
