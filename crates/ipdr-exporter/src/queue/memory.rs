//! In-memory record queue.

use std::collections::{HashMap, VecDeque};

use ipdr_wire::DataMessage;
use tracing::debug;

use super::{QueueError, QueuedRecord, RecordQueue};
use crate::types::SessionId;

#[derive(Debug, Default)]
struct SessionQueue {
    records: VecDeque<QueuedRecord>,
    /// Length of the transmitted (unacknowledged) prefix.
    in_flight: usize,
    current_config_id: Option<u16>,
}

/// Bounded in-memory queue.
#[derive(Debug)]
pub struct MemoryQueue {
    sessions: HashMap<SessionId, SessionQueue>,
    capacity: usize,
    window_size: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(100_000, 128)
    }
}

impl MemoryQueue {
    pub fn new(capacity: usize, window_size: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity,
            window_size: window_size as usize,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Returns the configuration id last announced for `session`.
    pub fn current_config_id(&self, session: SessionId) -> Option<u16> {
        self.sessions.get(&session).and_then(|q| q.current_config_id)
    }
}

impl RecordQueue for MemoryQueue {
    fn initialize(&mut self, capacity: usize, window_size: u32) {
        self.capacity = capacity;
        self.window_size = window_size as usize;
    }

    fn enqueue(&mut self, session: SessionId, message: DataMessage) -> Result<(), QueueError> {
        let capacity = self.capacity;
        let queue = self.sessions.entry(session).or_default();
        if queue.records.len() >= capacity {
            return Err(QueueError::Full { session, capacity });
        }
        if let Some(last) = queue.records.back() {
            if message.sequence <= last.dsn() {
                return Err(QueueError::OutOfSequence {
                    session,
                    dsn: message.sequence,
                });
            }
        }
        queue.records.push_back(QueuedRecord {
            message,
            transmitted_before: false,
        });
        Ok(())
    }

    fn next_to_transmit(&self, session: SessionId) -> Option<QueuedRecord> {
        let queue = self.sessions.get(&session)?;
        if queue.in_flight >= self.window_size {
            return None;
        }
        queue.records.get(queue.in_flight).cloned()
    }

    fn mark_transmitted(&mut self, session: SessionId, dsn: u64) {
        let Some(queue) = self.sessions.get_mut(&session) else {
            return;
        };
        let next = queue.in_flight;
        match queue.records.get_mut(next) {
            Some(record) if record.dsn() == dsn => {
                record.transmitted_before = true;
                queue.in_flight += 1;
            }
            _ => debug!(session = session.0, dsn, "mark_transmitted for a record not at the window edge"),
        }
    }

    fn acknowledge(&mut self, session: SessionId, config_id: u16, dsn: u64) -> usize {
        let Some(queue) = self.sessions.get_mut(&session) else {
            return 0;
        };
        let mut acked = 0;
        while queue.in_flight > 0 {
            match queue.records.front() {
                Some(front) if front.dsn() <= dsn => {
                    queue.records.pop_front();
                    queue.in_flight -= 1;
                    acked += 1;
                }
                _ => break,
            }
        }
        debug!(session = session.0, config_id, dsn, acked, "records acknowledged");
        acked
    }

    fn rewind(&mut self, session: SessionId) -> usize {
        self.sessions
            .get_mut(&session)
            .map(|q| std::mem::take(&mut q.in_flight))
            .unwrap_or(0)
    }

    fn outstanding(&self, session: SessionId) -> usize {
        self.sessions
            .get(&session)
            .map(|q| q.records.len() - q.in_flight)
            .unwrap_or(0)
    }

    fn unacknowledged(&self, session: SessionId) -> usize {
        self.sessions.get(&session).map(|q| q.in_flight).unwrap_or(0)
    }

    fn holds_context(&self, session: SessionId, config_id: u16) -> bool {
        self.sessions
            .get(&session)
            .map(|q| q.records.iter().any(|r| r.config_id() == config_id))
            .unwrap_or(false)
    }

    fn context_changed(&mut self, session: SessionId, config_id: u16) {
        self.sessions.entry(session).or_default().current_config_id = Some(config_id);
    }

    fn cleanup(&mut self, session: SessionId) -> usize {
        let Some(queue) = self.sessions.get_mut(&session) else {
            return 0;
        };
        let dropped = queue.records.len();
        queue.records.clear();
        queue.in_flight = 0;
        dropped
    }

    fn remove_session(&mut self, session: SessionId) -> usize {
        self.sessions
            .remove(&session)
            .map(|q| q.records.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const S: SessionId = SessionId(1);

    fn data(dsn: u64, config_id: u16) -> DataMessage {
        DataMessage {
            template_id: 1,
            config_id,
            flags: 0,
            sequence: dsn,
            payload: vec![dsn as u8],
        }
    }

    fn transmit_all(q: &mut MemoryQueue) -> Vec<u64> {
        let mut sent = Vec::new();
        while let Some(record) = q.next_to_transmit(S) {
            q.mark_transmitted(S, record.dsn());
            sent.push(record.dsn());
        }
        sent
    }

    #[test]
    fn test_window_limits_transmission() {
        let mut q = MemoryQueue::new(100, 2);
        for dsn in 0..5 {
            q.enqueue(S, data(dsn, 1)).unwrap();
        }

        assert_eq!(transmit_all(&mut q), vec![0, 1]);
        assert_eq!(q.unacknowledged(S), 2);
        assert_eq!(q.outstanding(S), 3);

        assert_eq!(q.acknowledge(S, 1, 0), 1);
        assert_eq!(transmit_all(&mut q), vec![2]);
        assert_eq!(q.acknowledge(S, 1, 2), 2);
        assert_eq!(transmit_all(&mut q), vec![3, 4]);
    }

    #[test]
    fn test_ack_only_covers_transmitted_prefix() {
        let mut q = MemoryQueue::new(100, 10);
        for dsn in 0..3 {
            q.enqueue(S, data(dsn, 1)).unwrap();
        }
        let record = q.next_to_transmit(S).unwrap();
        q.mark_transmitted(S, record.dsn());

        assert_eq!(q.acknowledge(S, 1, 99), 1);
        assert_eq!(q.outstanding(S), 2);
        assert_eq!(q.unacknowledged(S), 0);
    }

    #[test]
    fn test_rewind_marks_duplicates() {
        let mut q = MemoryQueue::new(100, 10);
        for dsn in 0..3 {
            q.enqueue(S, data(dsn, 1)).unwrap();
        }
        transmit_all(&mut q);

        assert_eq!(q.rewind(S), 3);
        assert_eq!(q.unacknowledged(S), 0);
        assert_eq!(q.outstanding(S), 3);
        assert!(q.next_to_transmit(S).unwrap().transmitted_before);
    }

    #[test]
    fn test_capacity_and_sequence() {
        let mut q = MemoryQueue::new(2, 10);
        q.enqueue(S, data(0, 1)).unwrap();
        q.enqueue(S, data(1, 1)).unwrap();
        assert_eq!(
            q.enqueue(S, data(2, 1)),
            Err(QueueError::Full {
                session: S,
                capacity: 2
            })
        );

        let mut q = MemoryQueue::new(10, 10);
        q.enqueue(S, data(5, 1)).unwrap();
        assert!(matches!(
            q.enqueue(S, data(5, 1)),
            Err(QueueError::OutOfSequence { .. })
        ));
    }

    #[test]
    fn test_holds_context_and_cleanup() {
        let mut q = MemoryQueue::new(10, 10);
        q.enqueue(S, data(0, 1)).unwrap();
        q.context_changed(S, 2);
        q.enqueue(S, data(1, 2)).unwrap();

        assert!(q.holds_context(S, 1));
        assert!(q.holds_context(S, 2));
        assert_eq!(q.current_config_id(S), Some(2));

        assert_eq!(q.cleanup(S), 2);
        assert!(!q.holds_context(S, 1));
        assert_eq!(q.remove_session(S), 0);
        assert_eq!(q.outstanding(S), 0);
    }
}
