//! The Raft transport interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for the transport which the core uses to send RPCs to
/// peer nodes of its group.
///
/// Serialization, addressing and framing are owned by the implementation; the core only
/// ever sees typed requests and replies.
#[async_trait]
pub trait RaftTransport<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Make the given peers addressable before replication to them begins.
    ///
    /// Called by the leader when a configuration change stages peers which the transport
    /// has not seen before. The default implementation assumes all peers are already
    /// addressable.
    async fn add_peers(&self, _peers: &[NodeId]) -> Result<()> {
        Ok(())
    }
}
