//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::raft_types::SnapshotSegmentId;
use crate::GroupId;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of the Raft server core.
///
/// These errors are either fatal to the core or surfaced to a peer over the wire; failures
/// which a client is expected to inspect travel inside the client reply as a
/// [`ClientException`] instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// The server core's lifecycle forbids the requested operation.
    #[error("the server is not yet ready to serve requests")]
    NotReady,
    /// An RPC arrived carrying a different group ID than the one this peer serves.
    #[error("group mismatch, expected {expected}, got {got}")]
    GroupMismatch { expected: GroupId, got: GroupId },
    /// An AppendEntries request carried a malformed entry sequence.
    #[error("invalid entry sequence: {0}")]
    InvalidEntries(String),
    /// An error which has come from the durable log storage layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the transport layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An error which has come from the attached state machine.
    #[error("{0}")]
    StateMachine(anyhow::Error),
    /// A received snapshot segment did not line up with the segment under assembly.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// An IO error from tokio.
    #[error("{0}")]
    IO(#[from] tokio::io::Error),
    /// The server core is shutting down.
    #[error("the server is shutting down")]
    ShuttingDown,
}

/// A failure reported to a client inside its reply.
///
/// Client facing failures are always wrapped into a reply object carrying
/// `success == false` plus one of these variants, so that client libraries can uniformly
/// inspect results (and so that cached replies replay identically).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ClientException {
    /// The peer's lifecycle forbids serving client requests.
    #[error("the server is not yet ready to serve requests")]
    NotReady,
    /// The request was addressed to a different group.
    #[error("group mismatch, expected {expected}, got {got}")]
    GroupMismatch { expected: GroupId, got: GroupId },
    /// This peer is not the leader.
    ///
    /// `leader_hint` carries the known leader if one is known, else a random member of the
    /// current configuration which the client may try next.
    #[error("this peer is not the leader, hint: {leader_hint:?}")]
    NotLeader {
        leader_hint: Option<NodeId>,
        peers: Vec<NodeId>,
    },
    /// This peer is the elected leader but has not yet committed an entry in its term.
    #[error("the leader is not yet ready")]
    LeaderNotReady,
    /// A stale read asked for an index this peer has not yet committed.
    #[error("stale read, requested min index {min_index} but commit index is {commit_index}")]
    StaleRead { min_index: u64, commit_index: u64 },
    /// The state machine failed the transaction; the failure is recorded in the retry cache.
    #[error("state machine failure: {message}")]
    StateMachineFailure { message: String },
    /// A configuration change is already in progress.
    #[error("a reconfiguration is already in progress")]
    ReconfigurationInProgress,
    /// The request did not complete within its allotted time.
    #[error("the request timed out")]
    Timeout,
}

/// The set of errors which may take place when initializing a pristine Raft peer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the state of the peer.
    ///
    /// The peer is not pristine: its log index and current term must both be 0.
    #[error("the requested action is not allowed due to the state of the node")]
    NotAllowed,
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChangeConfigError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The peer received the request but is not the leader.
    #[error("this node is not the leader, known leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),
    /// The proposed config would leave the group without members.
    #[error("the proposed config must have at least one member")]
    InoperableConfig,
    /// An earlier configuration change has not finished staging and committing.
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,
    /// The current configuration entry is not yet committed, so a new change may not start.
    #[error("the current configuration is not yet committed")]
    ConfigNotCommitted,
}

/// Error variants related to configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The min & max election timeouts do not form a valid range.
    #[error("given values for election timeout min & max do not form a valid range")]
    InvalidElectionTimeoutMinMax,
    /// The election timeout must be greater than the heartbeat interval.
    #[error("election timeout must be greater than heartbeat interval")]
    InvalidElectionTimeoutHeartbeat,
    /// The AppendEntries payload size must be greater than 0.
    #[error("maximum payload entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
    /// The retry cache must be able to hold at least one entry.
    #[error("retry cache capacity must be greater than 0")]
    RetryCacheCapacityTooSmall,
}
