use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// A Raft node's ID.
///
/// Peer IDs are totally ordered and must be stable for the life of a node.
pub type NodeId = u64;

/// The identifier of the Raft group a peer belongs to.
///
/// A peer belongs to exactly one group per core instance; RPCs carrying a different
/// group ID are rejected.
pub type GroupId = String;

/// The stable identifier of a client of the group.
pub type ClientId = String;

/// A client-chosen serial number; (client, call) keys the at-most-once retry cache.
pub type CallId = u64;

/// The identity of a raft log entry, which is the pair of term and index.
///
/// The total order over `LogId` is lexicographic: first by term, then by index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

/// The identity of a snapshot.
///
/// Even when two snapshots are built with the same last log id, they may still differ
/// in bytes, hence the dedicated id for transfer.
pub type SnapshotId = String;

/// The identity of a segment of a snapshot under transfer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl<T: ToString> From<(T, u64)> for SnapshotSegmentId {
    fn from(v: (T, u64)) -> Self {
        SnapshotSegmentId {
            id: v.0.to_string(),
            offset: v.1,
        }
    }
}

impl Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.id, self.offset)
    }
}

/// A way to differentiate between a value being updated or not.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}

/// A summary of a message for logging, cheaper than `Debug` for large payloads.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_order_is_lexicographic() {
        let a = LogId::new(1, 9);
        let b = LogId::new(2, 1);
        let c = LogId::new(2, 2);
        assert!(a < b);
        assert!(b < c);
        assert!(LogId::new(0, 0) < a);
    }
}
