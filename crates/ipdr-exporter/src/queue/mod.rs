//! Record queue layer.
//!
//! The exporter core never stores records itself. It enqueues built DATA
//! messages per session and asks the queue which record to transmit next,
//! what is still unacknowledged, and whether any record still refers to a
//! configuration id.

mod memory;

use ipdr_wire::DataMessage;
use thiserror::Error;

use crate::types::SessionId;

pub use memory::MemoryQueue;

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue for session {session} is full ({capacity} records)")]
    Full { session: SessionId, capacity: usize },

    #[error("Record {dsn} is out of sequence for session {session}")]
    OutOfSequence { session: SessionId, dsn: u64 },
}

/// A queued record and its transmission state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub message: DataMessage,
    /// True once the record has been handed to the transport at least once.
    pub transmitted_before: bool,
}

impl QueuedRecord {
    pub fn dsn(&self) -> u64 {
        self.message.sequence
    }

    pub fn config_id(&self) -> u16 {
        self.message.config_id
    }
}

/// Per-session record storage with a sliding acknowledgment window.
///
/// Each session's records are kept in DSN order as an unacknowledged prefix
/// (transmitted) followed by an outstanding suffix (not yet transmitted).
pub trait RecordQueue: Send {
    /// Resets capacity and window size. Existing records are kept.
    fn initialize(&mut self, capacity: usize, window_size: u32);

    fn enqueue(&mut self, session: SessionId, message: DataMessage) -> Result<(), QueueError>;

    /// First outstanding record, unless the window is full.
    fn next_to_transmit(&self, session: SessionId) -> Option<QueuedRecord>;

    /// Moves record `dsn` from the outstanding suffix into the window.
    fn mark_transmitted(&mut self, session: SessionId, dsn: u64);

    /// Removes every transmitted record with a DSN up to `dsn`. Returns how
    /// many were acknowledged.
    fn acknowledge(&mut self, session: SessionId, config_id: u16, dsn: u64) -> usize;

    /// Returns unacknowledged records to the outstanding state so they are
    /// retransmitted. Returns how many were rewound.
    fn rewind(&mut self, session: SessionId) -> usize;

    fn outstanding(&self, session: SessionId) -> usize;

    fn unacknowledged(&self, session: SessionId) -> usize;

    /// Returns true if any record of `session` carries `config_id`.
    fn holds_context(&self, session: SessionId, config_id: u16) -> bool;

    /// Informs the queue that new records use `config_id`.
    fn context_changed(&mut self, session: SessionId, config_id: u16);

    /// Drops every record of `session`. Returns how many were dropped.
    fn cleanup(&mut self, session: SessionId) -> usize;

    /// Forgets `session` entirely. Returns how many records were dropped.
    fn remove_session(&mut self, session: SessionId) -> usize;
}
