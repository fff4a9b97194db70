//! The durable log storage interface and data types.

use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::raft::Entry;
use crate::raft::MembershipConfig;
use crate::raft_types::SnapshotId;
use crate::AppData;
use crate::LogId;
use crate::NodeId;

/// Metadata of a snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Log entries upto which this snapshot includes, inclusive.
    pub last_log_id: LogId,

    /// The latest membership configuration covered by the snapshot.
    pub membership: MembershipConfig,

    /// To identify a snapshot when transferring.
    /// Caveat: even when two snapshots are built with the same `last_log_id`, they still
    /// could be different in bytes.
    pub snapshot_id: SnapshotId,
}

/// The data associated with the current snapshot.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// Metadata of the snapshot.
    pub meta: SnapshotMeta,

    /// A read handle to the associated snapshot.
    pub snapshot: Box<S>,
}

/// The election metadata a peer must flush before any RPC reveals the new value.
///
/// The storage implementation persists this record with atomic rename semantics; a
/// failure to persist is fatal to the current term and drives the core to `Closing`.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct PersistedMetadata {
    /// The last recorded term observed by this peer.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,

    /// The id of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved election metadata of the peer.
    pub metadata: PersistedMetadata,
    /// The latest group membership configuration found in the log, else a new initial
    /// membership config consisting only of this node's ID.
    pub membership: MembershipConfig,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    ///
    /// ### `id`
    /// The ID of the Raft node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            metadata: PersistedMetadata {
                current_term: 0,
                voted_for: None,
            },
            membership: MembershipConfig::new_initial(id),
        }
    }
}

/// A trait defining the interface of the replicated log's durable storage.
///
/// Appends are durable when the future resolves: the core advances its commit index and
/// acknowledges the leader only after `append` returns. The commit index is owned by the
/// core and pushed to storage with each advance via `save_commit_index`.
#[async_trait]
pub trait RaftLog<D>: Send + Sync + 'static
where D: AppData
{
    /// The storage engine's associated type used for exposing a snapshot for reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// Get the latest membership config found in the log.
    ///
    /// This must always be implemented as a reverse search through the log to find the
    /// most recent membership config to be appended to the log. If a snapshot pointer is
    /// encountered, the membership config embedded in the snapshot meta should be used.
    /// If the system is pristine, return the value of
    /// `MembershipConfig::new_initial(node_id)`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_membership_config(&self) -> Result<MembershipConfig>;

    /// Get the peer's state information from storage.
    ///
    /// When the core is first started, it calls this interface to fetch the last known
    /// state from stable storage. If no such entry exists due to being the first time the
    /// node has come online, then `InitialState::new_initial` should be used.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Durably flush the peer's election metadata.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_metadata(&self, md: &PersistedMetadata) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive:
    /// `[start, stop)`.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry. It is not an error for the entry to be absent.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Whether the log holds an entry with exactly the given id (term and index).
    async fn contains(&self, log_id: LogId) -> Result<bool>;

    /// Returns the last known log id.
    ///
    /// It could be the id of the last entry in the log, or the last applied id saved in
    /// the state machine. When there is no log or state machine, it returns (0, 0).
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// The index after the last entry in the log; 1 for an empty log.
    async fn get_next_index(&self) -> Result<u64>;

    /// The commit index most recently pushed to storage.
    async fn get_last_committed_index(&self) -> Result<u64>;

    /// Record an advance of the commit index.
    async fn save_commit_index(&self, commit_index: u64) -> Result<()>;

    /// Delete all logs in `range`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Append a payload of entries to the log, returning once they are durable.
    ///
    /// Though the entries will always be presented in order, each entry's index should be
    /// used to determine its location to be written in the log.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Perform log compaction, returning a handle to the generated snapshot.
    ///
    /// When performing log compaction, the compaction can only cover the breadth of the
    /// log up to the last applied log, and under write load this value may change
    /// quickly. The storage implementation should checkpoint its state machine view and
    /// use the checkpoint's last applied log as the snapshot's breadth.
    ///
    /// Errors returned from this method will be logged and retried.
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>>;

    /// Create a new blank snapshot, returning a writable handle to the snapshot object.
    ///
    /// The core uses this handle to receive chunk-mode snapshot data from the leader.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot which has finished streaming from the
    /// group leader.
    ///
    /// Delete all entries in the log through `meta.last_log_id.index`, write a purged
    /// marker at that index, and delete all other snapshots.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()>;

    /// Get a readable handle to the current snapshot, along with its metadata.
    ///
    /// A proper implementation will only ever have one active snapshot, though another
    /// may exist while it is being created.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait RaftLogDebug {
    /// Get the current persisted metadata for testing purposes.
    async fn read_metadata(&self) -> Option<PersistedMetadata>;
}
