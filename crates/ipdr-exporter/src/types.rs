//! Stable handles for exporter-owned objects.
//!
//! Handles other than [`SessionId`] are allocated monotonically by the
//! exporter and never reused, so a stale handle fails lookup instead of
//! aliasing a newer object.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session identifier carried in every message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u8);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for SessionId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Returns the raw handle value.
            pub fn raw(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Handle of a configured or dummy collector.
    CollectorId,
    "collector#"
);
handle_type!(
    /// Handle of a (session, collector) binding.
    CollectorSessionId,
    "cs#"
);
handle_type!(
    /// Handle of a pooled IPDR connection.
    ConnectionId,
    "conn#"
);

/// Opaque handle the transport assigns to one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportHandle(pub u64);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Monotonic allocator for `u32`-backed handles.
#[derive(Debug, Clone)]
pub(crate) struct HandleAllocator {
    next: u32,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl HandleAllocator {
    pub(crate) fn next(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.saturating_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_never_reused() {
        let mut alloc = HandleAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(CollectorId(3).to_string(), "collector#3");
        assert_eq!(ConnectionId(9).to_string(), "conn#9");
        assert_eq!(SessionId(7).to_string(), "7");
        assert_eq!(TransportHandle(12).to_string(), "handle#12");
    }
}
