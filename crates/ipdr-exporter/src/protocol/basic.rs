//! Plain IPDR/SP behavior.

use std::net::{IpAddr, Ipv4Addr};

use ipdr_wire::{
    Connect, ConnectResponse, Message, MessageHeader, SessionStart, SessionStop, SessionStopReason,
};
use tracing::{debug, warn};

use super::{ProtocolHandler, SessionStartInfo};
use crate::config::ExporterConfig;
use crate::error::ExporterResult;
use crate::events::DisconnectReason;
use crate::exporter::Exporter;
use crate::transport::{Transport, TransportError};
use crate::types::{SessionId, TransportHandle};

/// Default protocol: CONNECT on every new connection, priority-based
/// collector selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicProtocol;

fn send(
    transport: &dyn Transport,
    handle: TransportHandle,
    session: u8,
    message: Message,
) -> Result<(), TransportError> {
    let frame = message.encode(session)?;
    transport.send(handle, frame)
}

fn initiator_address(config: &ExporterConfig) -> Ipv4Addr {
    match config.bind_address {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    }
}

impl ProtocolHandler for BasicProtocol {
    fn on_connected(
        &self,
        transport: &dyn Transport,
        handle: TransportHandle,
        config: &ExporterConfig,
    ) -> Result<(), TransportError> {
        let connect = Connect {
            initiator_address: initiator_address(config),
            initiator_port: config.port,
            capabilities: config.capabilities(),
            keep_alive_interval: config.keep_alive_secs(),
            vendor_id: config.vendor_id.clone(),
        };
        send(transport, handle, 0, Message::Connect(connect))
    }

    fn send_session_start(
        &self,
        transport: &dyn Transport,
        handle: TransportHandle,
        start: &SessionStartInfo,
    ) -> Result<(), TransportError> {
        let message = SessionStart {
            exporter_boot_time: u32::try_from(start.boot_time.timestamp()).unwrap_or(0),
            first_record_sequence: start.first_dsn,
            dropped_record_count: start.dropped,
            primary: start.primary,
            ack_time_interval: u32::try_from(start.window_timeout.as_millis()).unwrap_or(u32::MAX),
            ack_sequence_interval: start.window_size,
            document_id: start.document_id.into_bytes(),
        };
        send(transport, handle, start.session.0, Message::SessionStart(message))
    }

    fn send_session_stop(
        &self,
        transport: &dyn Transport,
        handle: TransportHandle,
        session: SessionId,
        reason: SessionStopReason,
    ) -> Result<(), TransportError> {
        let message = SessionStop {
            reason,
            info: String::new(),
        };
        send(transport, handle, session.0, Message::SessionStop(message))
    }

    fn send_keep_alive(&self, transport: &dyn Transport, handle: TransportHandle) -> Result<(), TransportError> {
        send(transport, handle, 0, Message::KeepAlive)
    }
}

impl BasicProtocol {
    /// Decodes one inbound frame and drives the exporter accordingly.
    pub fn handle_frame(exporter: &Exporter, handle: TransportHandle, frame: &[u8]) -> ExporterResult<()> {
        let (header, message) = Message::decode(frame)?;
        exporter.message_received(handle)?;
        Self::dispatch(exporter, handle, &header, message)
    }

    fn dispatch(
        exporter: &Exporter,
        handle: TransportHandle,
        header: &MessageHeader,
        message: Message,
    ) -> ExporterResult<()> {
        let session = SessionId(header.session_id);
        match message {
            Message::Connect(connect) => {
                debug!(%handle, vendor = %connect.vendor_id, "CONNECT from collector");
                let config = exporter.config();
                let response = ConnectResponse {
                    capabilities: config.capabilities() & connect.capabilities,
                    keep_alive_interval: config.keep_alive_secs(),
                    vendor_id: config.vendor_id,
                };
                exporter.send_control(handle, 0, Message::ConnectResponse(response))?;
                exporter.connection_ready(handle)?;
            }
            Message::ConnectResponse(response) => {
                debug!(%handle, vendor = %response.vendor_id, "CONNECT_RESPONSE from collector");
                exporter.connection_ready(handle)?;
            }
            Message::FlowStart => exporter.collector_session_ready(handle, session)?,
            Message::FlowStop(stop) => {
                debug!(%handle, session = session.0, code = stop.reason_code, "FLOW_STOP from collector");
                exporter.flow_stopped(handle, session)?;
            }
            Message::DataAck(ack) => {
                exporter.data_acknowledged(handle, session, ack.config_id, ack.sequence)?;
            }
            Message::KeepAlive => {}
            Message::Disconnect => {
                exporter.close_connection(handle, DisconnectReason::Tcp)?;
            }
            Message::Error(err) => {
                warn!(%handle, code = err.code, description = %err.description, "ERROR from collector");
            }
            other => {
                debug!(%handle, message = other.id().name(), "ignoring unexpected message");
            }
        }
        Ok(())
    }
}
