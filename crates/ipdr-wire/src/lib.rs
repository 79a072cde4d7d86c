//! IPDR/SP wire codecs.
//!
//! This crate provides the bit-exact encodings the exporter core puts on the
//! wire:
//!
//! - [`MessageHeader`]: the 8-byte header carried by every IPDR/SP message
//! - [`Message`]: typed message bodies (DATA, DATA_ACK, CONNECT, SESSION_STOP, ...)
//! - [`VersionRequest`] / [`VersionResponse`]: the UDP protocol-info discovery exchange
//!
//! All multi-byte integers are in network byte order.

mod discovery;
mod header;
mod message;
mod reader;

pub use discovery::{
    ProtocolInfo, TransportType, VersionRequest, VersionResponse, DISCOVERY_MAGIC,
    VERSION_REQUEST_LEN, VERSION_RESPONSE_LEN,
};
pub use header::{MessageHeader, MessageId, HEADER_LEN, MAX_MESSAGE_LEN, PROTOCOL_VERSION};
pub use message::{
    capabilities, data_flags, Connect, ConnectResponse, DataAck, DataMessage, ErrorMessage,
    FlowStop, Message, SessionStart, SessionStop, SessionStopReason,
};

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message id 0x{0:02x}")]
    UnknownMessageId(u8),

    #[error("invalid message length {0}")]
    InvalidLength(u32),

    #[error("message of {0} bytes exceeds the maximum message length")]
    TooLarge(usize),

    #[error("discovery request does not carry the IPDR magic")]
    BadMagic,

    #[error("string field is not valid UTF-8")]
    InvalidString,

    #[error("unknown transport type {0}")]
    UnknownTransport(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;
