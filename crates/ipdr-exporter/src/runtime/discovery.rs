//! UDP version discovery responder.
//!
//! Collectors probe the discovery port with a version request; the exporter
//! answers with its boot time and the TCP port it accepts IPDR/SP on. The
//! socket is rebound when the discovery port, listen address or enablement
//! changes through `reconfigure`.

use std::net::SocketAddr;
use std::time::Duration;

use ipdr_wire::{VersionRequest, VersionResponse, VERSION_REQUEST_LEN};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::exporter::Exporter;

const CONFIG_POLL: Duration = Duration::from_secs(1);
const REBIND_BACKOFF: Duration = Duration::from_secs(5);

/// Builds the reply to one datagram, or `None` if it is not a version
/// request.
pub fn answer_datagram(datagram: &[u8], boot_time: u32, port: u16) -> Option<Vec<u8>> {
    if datagram.len() < VERSION_REQUEST_LEN {
        return None;
    }
    let request = VersionRequest::decode(datagram).ok()?;
    VersionResponse::answer(&request, boot_time, port).encode().ok()
}

/// Where the responder should be bound right now, if anywhere.
fn desired_bind(exporter: &Exporter) -> Option<SocketAddr> {
    let config = exporter.config();
    config
        .discovery_enabled
        .then(|| SocketAddr::new(config.bind_address, config.discovery_port))
}

/// Answers discovery requests until `shutdown` flips to true.
pub async fn run_discovery(exporter: Exporter, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(addr) = desired_bind(&exporter) else {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(CONFIG_POLL) => continue,
            }
        };

        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(%addr, error = %e, "failed to bind discovery socket");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(REBIND_BACKOFF) => continue,
                }
            }
        };
        info!(%addr, "discovery responder listening");

        let mut buf = [0u8; 512];
        let mut poll = tokio::time::interval(CONFIG_POLL);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = poll.tick() => {
                    if desired_bind(&exporter) != Some(addr) {
                        info!(%addr, "discovery configuration changed; rebinding");
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        let config = exporter.config();
                        let boot_time = u32::try_from(exporter.boot_time().timestamp()).unwrap_or(0);
                        match answer_datagram(&buf[..len], boot_time, config.port) {
                            Some(reply) => {
                                if let Err(e) = socket.send_to(&reply, peer).await {
                                    debug!(%peer, error = %e, "failed to send discovery reply");
                                }
                            }
                            None => debug!(%peer, len, "ignoring non-discovery datagram"),
                        }
                    }
                    Err(e) => debug!(error = %e, "discovery receive failed"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterStore, DISCOVERY_PORT, EXPORTER_ADDRESS};
    use crate::transport::MemoryTransport;
    use ipdr_wire::TransportType;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    #[test]
    fn test_answer_echoes_requester() {
        let request = VersionRequest {
            requester_address: Ipv4Addr::new(10, 0, 0, 7),
            requester_boot_time: 42,
        };
        let reply = answer_datagram(&request.encode(), 1000, 4737).unwrap();
        let response = VersionResponse::decode(&reply).unwrap();
        assert_eq!(response.requester_address, request.requester_address);
        assert_eq!(response.exporter_boot_time, 1000);
        assert_eq!(response.protocol.port, 4737);
        assert_eq!(response.protocol.transport, TransportType::Tcp);
    }

    #[test]
    fn test_garbage_is_ignored() {
        assert_eq!(answer_datagram(b"hello", 0, 4737), None);
        assert_eq!(answer_datagram(&[0u8; VERSION_REQUEST_LEN], 0, 4737), None);
    }

    #[tokio::test]
    async fn test_responder_answers_over_udp() {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let params = ParameterStore::new()
            .with(EXPORTER_ADDRESS, "127.0.0.1")
            .unwrap()
            .with(DISCOVERY_PORT, port.to_string())
            .unwrap();
        let exporter = Exporter::init(params, Arc::new(MemoryTransport::new())).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_discovery(exporter, stop_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = VersionRequest {
            requester_address: Ipv4Addr::LOCALHOST,
            requester_boot_time: 1,
        };
        let mut buf = [0u8; 64];
        let mut answered = None;
        for _ in 0..50 {
            client
                .send_to(&request.encode(), ("127.0.0.1", port))
                .await
                .unwrap();
            if let Ok(Ok((len, _))) =
                tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await
            {
                answered = Some(VersionResponse::decode(&buf[..len]).unwrap());
                break;
            }
        }
        let response = answered.expect("no discovery reply");
        assert_eq!(response.protocol.port, 4737);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
