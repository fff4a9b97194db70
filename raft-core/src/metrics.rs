//! Metrics published by a running server core.
//!
//! The core publishes metrics on a `watch` channel on every state change: its id and
//! group, role, current term, log/applied progress, known leader, membership and, while
//! leader, per-follower replication progress. Instances are consumed by observability
//! layers and by the `Wait` utility, which tests use to synchronize on conditions.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::core::Role;
use crate::raft::MembershipConfig;
use crate::replication::ReplicationMetrics;
use crate::GroupId;
use crate::LogId;
use crate::NodeId;

/// The metrics of the leader about its followers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics of all known replication targets.
    pub replication: HashMap<NodeId, ReplicationMetrics>,
}

/// A set of metrics describing the current state of a Raft server core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The group the node belongs to.
    pub group_id: GroupId,
    /// The role of the Raft node.
    pub role: Role,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index that has been appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index that has been applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the group.
    pub membership_config: MembershipConfig,

    /// The id of the last log included in the latest snapshot.
    pub snapshot: LogId,

    /// The metrics about the leader. It is `None` if the node is not a leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl ServerMetrics {
    pub(crate) fn new_initial(id: NodeId, group_id: GroupId) -> Self {
        Self {
            id,
            group_id,
            role: Role::Starting,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::new_initial(id),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

/// Error variants of a `Wait`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Wait for metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ServerMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy `func`.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<ServerMetrics, WaitError>
    where T: Fn(&ServerMetrics) -> bool + Send {
        let timeout_at = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();

            if func(&latest) {
                tracing::debug!("wait condition satisfied: {} metrics: {:?}", msg.to_string(), latest);
                return Ok(latest);
            }

            let delay = sleep_until(timeout_at);
            tokio::select! {
                _ = delay => {
                    tracing::debug!("wait timeout: {} latest: {:?}", msg.to_string(), latest);
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg.to_string(), latest)));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `current_term` to become `want` or greater.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_term(&self, want: u64, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.current_term >= want,
            &format!("{} .current_term >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait until applied at least `want` logs.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want && m.last_applied >= want,
            &format!("{} .last_log_index >= {} && .last_applied >= {}", msg.to_string(), want, want),
        )
        .await
    }

    /// Wait for the role to become `want`.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn role(&self, want: Role, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(|m| m.role == want, &format!("{} .role == {:?}", msg.to_string(), want)).await
    }

    /// Wait for `current_leader` to become `want`.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_leader(&self, want: NodeId, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(want),
            &format!("{} .current_leader == {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the snapshot to cover `want`.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn snapshot(&self, want: LogId, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(|m| m.snapshot == want, &format!("{} .snapshot == {}", msg.to_string(), want)).await
    }

    /// Wait for the membership members to become `want`.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn members(&self, want: std::collections::BTreeSet<NodeId>, msg: impl ToString) -> Result<ServerMetrics, WaitError> {
        self.metrics(
            |m| m.membership_config.members == want,
            &format!("{} .membership_config.members == {:?}", msg.to_string(), want),
        )
        .await
    }
}
