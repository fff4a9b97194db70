//! An async Raft consensus server core.
//!
//! This crate implements one participant of a Raft group: the role state machine
//! (follower / candidate / leader), persisted election metadata, the replicated log's
//! in-memory view, leader-side replication to followers, snapshot installation, and the
//! client request path with at-most-once retry semantics.
//!
//! The core is parameterized over its collaborators: the RPC transport
//! ([`RaftTransport`]), the durable log storage ([`RaftLog`]), and the user supplied
//! state machine ([`StateMachine`]). Tests instantiate multiple cores in the same
//! process and wire them together with an in-memory router.

pub mod config;
mod core;
pub mod error;
mod lifecycle;
pub mod metrics;
pub mod network;
mod quorum;
pub mod raft;
mod raft_types;
mod replication;
pub mod retry_cache;
mod commit_info;
mod pending;
mod state;
pub mod state_machine;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use async_trait;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::Role;
pub use crate::error::ClientException;
pub use crate::error::RaftError;
pub use crate::lifecycle::LifeCycle;
pub use crate::lifecycle::LifeCycleState;
pub use crate::metrics::ServerMetrics;
pub use crate::network::RaftTransport;
pub use crate::raft::RaftServer;
pub use crate::raft_types::CallId;
pub use crate::raft_types::ClientId;
pub use crate::raft_types::GroupId;
pub use crate::raft_types::LogId;
pub use crate::raft_types::MessageSummary;
pub use crate::raft_types::NodeId;
pub use crate::raft_types::SnapshotId;
pub use crate::raft_types::SnapshotSegmentId;
pub use crate::raft_types::Update;
pub use crate::commit_info::CommitInfo;
pub use crate::replication::ReplicationMetrics;
pub use crate::state_machine::StateMachine;
pub use crate::storage::RaftLog;
pub use crate::storage::RaftLogDebug;

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through the consensus core. Instead, applications can present
/// their data models as-is, and the core will present it to the attached state machine when it is
/// time to apply a committed entry.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining the application's response to a successfully applied transaction.
///
/// The state machine returns one value of this type per applied `StateMachineEntry`; the value is
/// cached in the retry cache, so replays of a completed call observe the identical response.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}
