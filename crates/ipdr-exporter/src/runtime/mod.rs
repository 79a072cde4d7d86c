//! Tokio runtime glue for the daemon.
//!
//! The exporter core is synchronous and socket-free. This module supplies a
//! TCP [`Transport`](crate::transport::Transport), the task that feeds
//! socket events and timer ticks into the core, and the UDP discovery
//! responder.

mod discovery;
mod driver;
mod tcp;

pub use discovery::{answer_datagram, run_discovery};
pub use driver::{ExporterDriver, DEFAULT_TICK};
pub use tcp::{split_frames, TcpTransport, TransportEvent};
