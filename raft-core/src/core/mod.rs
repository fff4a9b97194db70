//! The core logic of a Raft server.

mod admin;
mod append_entries;
mod apply;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::commit_info::CommitInfoCache;
use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::apply::AppliedEntry;
use crate::core::client::WatchRequest;
use crate::error::ChangeConfigError;
use crate::error::ClientException;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::lifecycle::LifeCycle;
use crate::lifecycle::LifeCycleState;
use crate::metrics::LeaderMetrics;
use crate::metrics::ServerMetrics;
use crate::pending::PendingRequests;
use crate::raft::ChangeConfigTx;
use crate::raft::ClientReply;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::GroupInfo;
use crate::raft::MembershipConfig;
use crate::raft::RaftMsg;
use crate::replication::AppenderEvent;
use crate::replication::AppenderFeedback;
use crate::replication::ReplicationStream;
use crate::retry_cache::RetryCache;
use crate::state::ServerState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftLog;
use crate::RaftTransport;
use crate::StateMachine;
use crate::Update;

/// The core type implementing the Raft protocol for one peer.
pub struct ServerCore<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The `RaftTransport` implementation.
    transport: Arc<T>,
    /// The `RaftLog` implementation.
    log: Arc<L>,
    /// The attached state machine.
    state_machine: Arc<M>,
    /// The lifecycle gate, shared with the public handle.
    lifecycle: Arc<LifeCycle>,

    /// The target role of the core.
    target_role: Role,
    /// The persisted and volatile per-peer state.
    state: ServerState,
    /// The at-most-once client retry cache.
    retry_cache: RetryCache<R>,
    /// Last known committed index per peer, monotonic.
    commit_infos: CommitInfoCache,
    /// Client writes this peer originated which have not yet been applied.
    pending_requests: PendingRequests<D>,

    /// The highest log index already handed to the apply stream.
    ///
    /// Trails `commit_index` only momentarily; results folding back in advance
    /// `state.last_applied`.
    last_enqueued_apply: u64,
    /// The stream of batches being applied to the state machine.
    ///
    /// Batches resolve strictly in log order, so the state machine observes entries in
    /// index order even though application happens off the core task.
    apply_stream: FuturesOrdered<JoinHandle<anyhow::Result<Vec<AppliedEntry<R>>>>>,

    /// The node's current snapshot state (building locally, or streaming in chunks from
    /// the leader).
    snapshot_state: Option<SnapshotState<L::SnapshotData>>,

    tx_snapshot: mpsc::UnboundedSender<SnapshotEvent>,
    rx_snapshot: mpsc::UnboundedReceiver<SnapshotEvent>,

    /// The last time a heartbeat was received from a valid leader.
    last_heartbeat: Option<Instant>,
    /// The deadline of the follower election timeout.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<ServerMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D, R, T, L, M> ServerCore<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        transport: Arc<T>,
        log: Arc<L>,
        state_machine: Arc<M>,
        lifecycle: Arc<LifeCycle>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<ServerMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_snapshot, rx_snapshot) = mpsc::unbounded_channel();
        let retry_cache = RetryCache::new(
            config.retry_cache_capacity,
            StdDuration::from_millis(config.retry_cache_expiry),
        );
        let this = Self {
            id,
            config,
            transport,
            log,
            state_machine,
            lifecycle,
            target_role: Role::Starting,
            state: ServerState::new(id),
            retry_cache,
            commit_infos: CommitInfoCache::new(),
            pending_requests: PendingRequests::new(),
            last_enqueued_apply: 0,
            apply_stream: FuturesOrdered::new(),
            snapshot_state: None,
            tx_snapshot,
            rx_snapshot,
            last_heartbeat: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, group=%self.config.group_id))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft server core is initializing");
        self.lifecycle.start()?;

        let initial = self.log.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.state.load_metadata(initial.metadata);
        self.state.last_log_id = initial.last_log_id;
        self.state.last_applied = initial.last_applied_log;
        self.state.update_membership(initial.membership, LogId::default());
        // NOTE: it is unsafe to initialize the commit index to anything but 0. The commit
        // index must be determined by a leader after committing a new log to the cluster.
        self.last_enqueued_apply = initial.last_applied_log.index;

        if let Some(snapshot) =
            self.log.get_current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?
        {
            self.state.snapshot_last_log_id = snapshot.meta.last_log_id;
            self.report_metrics(Update::Ignore);
        }
        // The state machine may stand on a snapshot installed at a leader's direction.
        match self.state_machine.latest_snapshot().await {
            Ok(Some(installed)) if installed > self.state.snapshot_last_log_id => {
                self.state.installed_snapshot = Some(installed);
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error=%err, "error reading the state machine's latest snapshot"),
        }

        let has_log = self.state.last_log_id.index != u64::MIN;
        let single = self.state.membership.members.len() == 1;
        let is_member = self.state.membership.contains(&self.id);

        self.target_role = match (has_log, single, is_member) {
            // A pristine peer which is alone in its initial config: remain Starting until
            // it is either initialized or contacted by a leader bootstrapping a group.
            (false, true, true) => Role::Starting,
            // A peer with state which no longer belongs to the config: keep replicating
            // but stay out of elections.
            (_, _, false) => Role::Starting,
            // The only configured member with live state is a single-node cluster.
            (true, true, true) => Role::Leader,
            // Otherwise it is a follower.
            _ => Role::Follower,
        };

        if self.target_role == Role::Follower || self.target_role == Role::Leader {
            let _ = self.lifecycle.transition(LifeCycleState::Running);
        }

        if self.target_role == Role::Follower {
            // Use a 30(ish) second overhead on the initial election timeout: restarted
            // nodes must not disrupt a stable group by timing out and driving up their
            // term before network communication is established.
            let inst = Instant::now()
                + Duration::from_secs(2)
                + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!("id={} target_role: {:?}", self.id, self.target_role);

        // This is the central loop of the system. The core assumes different roles based
        // on group state, delegating control to the role's own loop; a delegated loop
        // returns only when a role change is required or an error was hit.
        let res = loop {
            match &self.target_role {
                Role::Leader => {
                    if let Err(err) = LeaderState::new(&mut self).run().await {
                        break Err(err);
                    }
                }
                Role::Candidate => {
                    if let Err(err) = CandidateState::new(&mut self).run().await {
                        break Err(err);
                    }
                }
                Role::Follower => {
                    if let Err(err) = FollowerState::new(&mut self).run().await {
                        break Err(err);
                    }
                }
                Role::Starting => {
                    if let Err(err) = StartingState::new(&mut self).run().await {
                        break Err(err);
                    }
                }
                Role::Shutdown => {
                    tracing::info!("node has shutdown");
                    break Ok(());
                }
            }
        };

        // Outstanding client requests are failed, not dropped, so waiters see a reply.
        self.fail_all_pending(ClientException::NotReady);
        let _ = self.lifecycle.transition(LifeCycleState::Closing);
        let _ = self.lifecycle.transition(LifeCycleState::Closed);
        res
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(ServerMetrics {
            id: self.id,
            group_id: self.config.group_id.clone(),
            role: self.target_role,
            current_term: self.state.current_term(),
            last_log_index: self.state.last_log_id.index,
            last_applied: self.state.last_applied.index,
            current_leader: self.state.leader_id(),
            membership_config: self.state.membership.clone(),
            snapshot: self.state.latest_snapshot_id(),
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Durably flush the peer's election metadata.
    ///
    /// A persist failure is fatal to the current term: the core transitions to `Closing`.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_metadata(&mut self) -> RaftResult<()> {
        self.state
            .persist_metadata::<D, L>(self.log.as_ref())
            .await
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the core's target role, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_role(&mut self, target_role: Role) {
        if target_role == Role::Follower && !self.state.membership.contains(&self.id) {
            self.target_role = Role::Starting;
        } else {
            self.target_role = target_role;
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a fresh random value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();

        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        tracing::debug!("update election timeout after: {:?}", t);

        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Whether a valid leader was heard from within the minimum election timeout, in
    /// which case votes are withheld from disruptive candidates.
    fn heard_from_leader_recently(&self) -> bool {
        match self.last_heartbeat {
            Some(inst) => inst.elapsed() < Duration::from_millis(self.config.election_timeout_min),
            None => false,
        }
    }

    /// Update the value of the current leader.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.state.set_leader(Some(self.id));
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.state.set_leader(Some(target));
            }
            UpdateCurrentLeader::Unknown => {
                self.state.set_leader(None);
            }
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is non-recoverable. As such,
    /// the core will be instructed to stop. If such behavior is not needed, then don't use
    /// this interface.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        let _ = self.lifecycle.transition(LifeCycleState::Closing);
        self.set_target_role(Role::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Update the node's current membership config.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_membership(&mut self, cfg: MembershipConfig, log_id: LogId) -> RaftResult<()> {
        // If the given config does not contain this node's ID, it means one of the
        // following:
        //
        // - the node is currently bootstrapping and is replicating an old config to which
        //   it has not yet been added.
        // - the node has been removed from the group. The parent application can observe
        //   the transition to the Starting role as a signal for when it is safe to
        //   shutdown a node being removed.
        self.state.update_membership(cfg, log_id);
        if !self.state.membership.contains(&self.id) {
            self.set_target_role(Role::Starting);
        } else if self.target_role == Role::Starting
            && self.state.membership.members.contains(&self.id)
            && self.lifecycle.is_running()
        {
            // The node is now configured as a voting member; transition to follower.
            self.set_target_role(Role::Follower);
        }
        Ok(())
    }

    /// Fold configuration entries carried in an AppendEntries payload into the
    /// configuration view (uncommitted until the commit index advances past them).
    #[tracing::instrument(level = "trace", skip(self, entries))]
    fn update_membership_from_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        let conf = entries.iter().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(conf) => Some((conf.membership.clone(), entry.log_id)),
            _ => None,
        });
        if let Some((membership, log_id)) = conf {
            self.update_membership(membership, log_id)?;
        }
        Ok(())
    }

    /// The commit infos of the group as known to this peer, its own first.
    fn commit_infos_snapshot(&mut self) -> Vec<crate::commit_info::CommitInfo> {
        self.commit_infos.update(self.id, self.state.commit_index());
        self.commit_infos.to_vec()
    }

    /// Build a failure reply for a client request which cannot be admitted.
    fn client_failure_reply(
        &mut self,
        client_id: crate::ClientId,
        call_id: crate::CallId,
        exception: ClientException,
    ) -> Arc<ClientReply<R>> {
        let commit_infos = self.commit_infos_snapshot();
        Arc::new(ClientReply::failure(client_id, call_id, 0, exception, commit_infos))
    }

    /// The NotLeader exception carrying a leader hint: the known leader if known, else a
    /// random member of the current configuration.
    fn not_leader_exception(&self) -> ClientException {
        let peers: Vec<NodeId> = self.state.membership.all_nodes().into_iter().collect();
        let leader_hint = self.state.leader_id().or_else(|| {
            use rand::seq::SliceRandom;
            peers.choose(&mut rand::thread_rng()).copied()
        });
        ClientException::NotLeader { leader_hint, peers }
    }

    /// Fail every outstanding pending request with the given exception.
    ///
    /// Waiters are answered through their retry cache entries; the failed entries do not
    /// suppress later retries against the new leader.
    #[tracing::instrument(level = "trace", skip(self))]
    fn fail_all_pending(&mut self, exception: ClientException) {
        let drained = self.pending_requests.drain();
        if drained.is_empty() {
            return;
        }
        tracing::debug!("failing {} pending client requests", drained.len());
        let commit_infos = self.commit_infos_snapshot();
        for (index, key) in drained {
            let reply = Arc::new(ClientReply::failure(
                key.0.clone(),
                key.1,
                index,
                exception.clone(),
                commit_infos.clone(),
            ));
            self.retry_cache.complete(key, reply);
        }
    }

    /// Answer a group info query.
    fn handle_group_info(&mut self, tx: oneshot::Sender<GroupInfo>) {
        let info = GroupInfo {
            id: self.id,
            group_id: self.config.group_id.clone(),
            role: self.target_role,
            current_term: self.state.current_term(),
            leader: self.state.leader_id(),
            commit_infos: self.commit_infos_snapshot(),
            membership: self.state.membership.clone(),
        };
        let _ = tx.send(info);
    }

    /// Update the system's snapshot state based on the given event.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_snapshot_event(&mut self, event: SnapshotEvent) -> RaftResult<()> {
        match event {
            SnapshotEvent::CompactionComplete(log_id) => {
                self.state.snapshot_last_log_id = log_id;
                self.report_metrics(Update::Ignore);
                // If snapshot state is anything other than streaming, then drop it.
                if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
                    self.snapshot_state = Some(state);
                }
            }
            SnapshotEvent::CompactionFailed => {
                if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
                    self.snapshot_state = Some(state);
                }
            }
            SnapshotEvent::InstallSettled { installed, leader_term } => {
                self.finish_notified_install(installed, leader_term).await?;
            }
            SnapshotEvent::InstallFailed => {
                // The finalizer: whatever became of the state machine's install future,
                // the marker is cleared so the leader's next notification can retry.
                self.state.in_progress_snapshot = None;
            }
        }
        Ok(())
    }

    /// Trigger a log compaction (snapshot) job if needed.
    /// If force is true, it will skip the threshold check and start creating a snapshot
    /// as demanded.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        // Check to ensure we have actual entries for compaction.
        let covered = self.state.latest_snapshot_id().index;
        if self.state.last_applied.index == 0 || self.state.last_applied.index < covered {
            return;
        }

        if !force && self.state.last_applied.index < covered + *threshold {
            return;
        }

        // At this point, we are clear to begin a new compaction process.
        let log = self.log.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_snapshot = self.tx_snapshot.clone();
        self.snapshot_state = Some(SnapshotState::Snapshotting {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                let f = log.do_log_compaction();
                let res = Abortable::new(f, reg).await;
                match res {
                    Ok(res) => match res {
                        Ok(snapshot) => {
                            let _ = tx_snapshot.send(SnapshotEvent::CompactionComplete(snapshot.meta.last_log_id));
                            let _ = chan_tx.send(snapshot.meta.last_log_id.index); // This will always succeed.
                        }
                        Err(err) => {
                            tracing::error!({error=%err}, "error while generating snapshot");
                            let _ = tx_snapshot.send(SnapshotEvent::CompactionFailed);
                        }
                    },
                    Err(_aborted) => {
                        let _ = tx_snapshot.send(SnapshotEvent::CompactionFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("beginning new log compaction process")),
        );
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The current snapshot state of the core.
pub(self) enum SnapshotState<S> {
    /// The core is compacting itself.
    Snapshotting {
        /// A handle to abort the compaction process early if needed.
        handle: AbortHandle,
        /// A sender for notifying any other tasks of the completion of this compaction.
        sender: broadcast::Sender<u64>,
    },
    /// The core is streaming in a snapshot from the leader.
    Streaming {
        /// The offset of the last byte written to the snapshot.
        offset: u64,
        /// The ID of the snapshot being written.
        id: String,
        /// A handle to the snapshot writer.
        snapshot: Box<S>,
    },
}

/// An update on an asynchronous snapshot process.
#[derive(Debug)]
pub(self) enum SnapshotEvent {
    /// Local snapshot creation has finished successfully and covers the given index.
    CompactionComplete(LogId),
    /// Local snapshot creation failed.
    CompactionFailed,
    /// A leader-notified state machine install settled at the given log id.
    InstallSettled { installed: LogId, leader_term: u64 },
    /// A leader-notified install failed or timed out; the in-progress marker must clear.
    InstallFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible roles of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is starting (or no longer a configured member): replicating entries, but
    /// neither voting nor timing out.
    Starting,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the group leader.
    Candidate,
    /// The node is the group leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl Role {
    /// Check if currently in the starting role.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting)
    }

    /// Check if currently in follower role.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate role.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader role.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the group leader.
pub(self) struct LeaderState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    pub(super) core: &'a mut ServerCore<D, R, T, L, M>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState<D>>,
    /// A mapping of peers being staged into the group by a configuration change.
    pub(super) staging_nodes: BTreeMap<NodeId, StagingReplicationState<D>>,
    /// A bool indicating if this node will be stepping down after committing the current
    /// config change.
    pub(super) is_stepping_down: bool,

    /// Whether this leader has committed an entry of its own term.
    ///
    /// Until the no-op entry committed on election round-trips a majority, reads and
    /// writes are refused with LeaderNotReady (completed retries excepted).
    pub(super) ready: bool,
    /// The index of the first entry appended in this leader's term.
    pub(super) first_index_of_term: u64,

    /// The metrics about a leader.
    pub leader_metrics: LeaderMetrics,

    /// The stream of feedback events coming from appenders.
    pub(super) feedback_rx: mpsc::UnboundedReceiver<(AppenderFeedback<L::SnapshotData>, Span)>,
    /// The cloneable sender for appender feedback events.
    pub(super) feedback_tx: mpsc::UnboundedSender<(AppenderFeedback<L::SnapshotData>, Span)>,

    /// Watch requests awaiting a replication level.
    pub(super) watches: Vec<WatchRequest<R>>,

    /// The response channel of an accepted configuration change, resolved when the final
    /// config entry commits (its index is recorded once that entry is appended).
    pub(super) conf_change_response: Option<ConfChangeResponse>,

    /// A field tracking the group's current consensus state, for dynamic membership.
    pub(super) consensus_state: ConsensusState,
}

impl<'a, D, R, T, L, M> LeaderState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Create a new instance.
    pub(self) fn new(core: &'a mut ServerCore<D, R, T, L, M>) -> Self {
        let consensus_state = if core.state.membership.is_in_joint_consensus() {
            ConsensusState::Joint { is_committed: false }
        } else {
            ConsensusState::Uniform
        };
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            staging_nodes: BTreeMap::new(),
            is_stepping_down: false,
            ready: false,
            first_index_of_term: 0,
            leader_metrics: LeaderMetrics::default(),
            feedback_tx,
            feedback_rx,
            watches: Vec::new(),
            conf_change_response: None,
            consensus_state,
        }
    }

    /// Transition to the leader role.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_role="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn one appender per peer.
        let targets = self
            .core
            .state
            .membership
            .all_nodes()
            .into_iter()
            .filter(|elem| elem != &self.core.id)
            .collect::<Vec<_>>();

        for target in targets {
            let state = self.spawn_appender(target, false);
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8, commit an initial entry as part of becoming the group leader.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_role.is_leader() {
                tracing::info!("id={} role becomes: {:?}", self.core.id, self.core.target_role);
                self.step_down();
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            tracing::debug!("leader recv from rx_api: AppendEntries, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_append_entries(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            tracing::debug!("leader recv from rx_api: RequestVote, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            tracing::debug!("leader recv from rx_api: InstallSnapshot, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_install_snapshot(rpc).await);
                        }
                        RaftMsg::ClientRequest { rpc, tx } => {
                            tracing::debug!("leader recv from rx_api: ClientRequest, {}", rpc.summary());
                            self.handle_client_request(rpc, tx).await;
                        }
                        RaftMsg::Initialize { tx, .. } => {
                            let _ = tx.send(Err(crate::error::InitializeError::NotAllowed));
                        }
                        RaftMsg::SetConfiguration { members, tx } => {
                            tracing::debug!("leader recv from rx_api: SetConfiguration, {:?}", members);
                            self.set_configuration(members, tx).await;
                        }
                        RaftMsg::GetGroupInfo { tx } => {
                            self.core.handle_group_info(tx);
                        }
                    }
                },
                Some(event) = self.core.rx_snapshot.recv() => {
                    tracing::debug!("leader recv from rx_snapshot: {:?}", event);
                    self.core.handle_snapshot_event(event).await?;
                }
                Some((event, span)) = self.feedback_rx.recv() => {
                    tracing::debug!("leader recv from feedback_rx: {}", event.summary());
                    let _ent = span.enter();
                    self.handle_appender_feedback(event).await?;
                }
                Some(Ok(applied)) = self.core.apply_stream.next() => {
                    let summaries = self.core.handle_applied_entries(applied)?;
                    self.post_apply(summaries).await?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    let _ = self.core.lifecycle.transition(LifeCycleState::Closing);
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }

    /// Tear down leader-only state ahead of the next role: halt appenders, fail pending
    /// requests and watches, and drop any staging configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    fn step_down(&mut self) {
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((AppenderEvent::Terminate, tracing::debug_span!("CH")));
        }
        for node in self.staging_nodes.values() {
            let _ = node.state.replstream.repl_tx.send((AppenderEvent::Terminate, tracing::debug_span!("CH")));
        }

        let exception = self.core.not_leader_exception();
        self.core.fail_all_pending(exception.clone());
        self.fail_watches(exception.clone());

        if let ConsensusState::StagingSync { tx, .. } = std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform) {
            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(None)));
        }
    }

    /// Report metrics with leader specific states.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        self.core.report_metrics(Update::Update(Some(&self.leader_metrics)));
    }
}

/// The response channel of an in-flight configuration change.
pub(self) struct ConfChangeResponse {
    /// The log index of the final configuration entry, known once it is appended.
    pub final_index: Option<u64>,
    pub tx: ChangeConfigTx,
}

/// A struct tracking the state of an appender from the perspective of the leader.
pub(self) struct ReplicationState<D: AppData> {
    pub matched: LogId,
    pub remove_after_commit: Option<u64>,
    pub replstream: ReplicationStream<D>,
}

/// The same as `ReplicationState`, except for peers being staged into the group.
pub(self) struct StagingReplicationState<D: AppData> {
    /// The replication stream state.
    pub state: ReplicationState<D>,
    /// A bool indicating if this staging peer has caught up enough to join the group.
    pub is_ready_to_join: bool,
}

/// A state enum used by the leader to navigate the configuration change protocol.
pub(self) enum ConsensusState {
    /// The group is preparing to go into joint consensus, but the leader is still syncing
    /// staging peers to prepare them for membership.
    StagingSync {
        /// The set of staging peers which are still catching up.
        awaiting: HashSet<NodeId>,
        /// The full membership change which has been proposed.
        members: BTreeSet<NodeId>,
        /// The response channel to use once the change fully commits.
        tx: ChangeConfigTx,
    },
    /// The group is in a joint consensus state and is syncing new peers.
    Joint {
        /// A bool indicating if the associated joint config has yet been committed.
        ///
        /// A new leader initializes this to false and updates it to true once its no-op
        /// entry has been committed.
        is_committed: bool,
    },
    /// The group's consensus is uniform; not in a joint consensus state.
    Uniform,
}

impl ConsensusState {
    /// Check if it is currently safe to finalize a joint consensus.
    ///
    /// The return value will be true if:
    /// 1. this object currently represents a joint consensus state.
    /// 2. the corresponding config for this consensus state has been committed.
    pub fn is_joint_consensus_safe_to_finalize(&self) -> bool {
        match self {
            ConsensusState::Joint { is_committed } => *is_committed,
            _ => false,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate role.
pub(self) struct CandidateState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    core: &'a mut ServerCore<D, R, T, L, M>,
    /// The number of votes granted by peers of the old (current) config group.
    votes_granted_old: u64,
    /// The number of votes needed from the old (current) config group.
    votes_needed_old: u64,
    /// The number of votes granted by peers of the new config group (if joint).
    votes_granted_new: u64,
    /// The number of votes needed from the new config group (if joint).
    votes_needed_new: u64,
}

impl<'a, D, R, T, L, M> CandidateState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    pub(self) fn new(core: &'a mut ServerCore<D, R, T, L, M>) -> Self {
        Self {
            core,
            votes_granted_old: 0,
            votes_needed_old: 0,
            votes_granted_new: 0,
            votes_needed_new: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_role="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_role.is_candidate() {
                return Ok(());
            }

            // Setup initial state per term.
            self.votes_granted_old = 1; // We must vote for ourselves per the Raft spec.
            self.votes_needed_old = crate::quorum::majority_of(self.core.state.membership.members.len()) as u64;
            if let Some(nodes) = &self.core.state.membership.members_after_consensus {
                self.votes_granted_new = 1; // We must vote for ourselves per the Raft spec.
                self.votes_needed_new = crate::quorum::majority_of(nodes.len()) as u64;
            }

            // Setup new term.
            self.core.update_next_election_timeout(false); // Generates a new rand value within range.
            self.core.state.new_candidate_term();
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_metadata().await?;
            self.core.report_metrics(Update::Update(None));

            // Send RPCs to all members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this role.
            loop {
                if !self.core.target_role.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    // This election has timed out. Break to outer loop, which starts a new
                    // term, and let the state machine know nobody is leading.
                    _ = timeout_fut => {
                        let sm = self.core.state_machine.clone();
                        let group_id = self.core.config.group_id.clone();
                        tokio::spawn(async move { sm.notify_no_leader(&group_id, Role::Candidate).await });
                        break;
                    }
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_entries(rpc).await);
                            }
                            RaftMsg::RequestVote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot { rpc, tx } => {
                                let _ = tx.send(self.core.handle_install_snapshot(rpc).await);
                            }
                            RaftMsg::ClientRequest { rpc, tx } => {
                                self.core.handle_nonleader_client_request(rpc, tx);
                            }
                            RaftMsg::Initialize { tx, .. } => {
                                let _ = tx.send(Err(crate::error::InitializeError::NotAllowed));
                            }
                            RaftMsg::SetConfiguration { tx, .. } => {
                                let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.core.state.leader_id())));
                            }
                            RaftMsg::GetGroupInfo { tx } => {
                                self.core.handle_group_info(tx);
                            }
                        }
                    },
                    Some(event) = self.core.rx_snapshot.recv() => self.core.handle_snapshot_event(event).await?,
                    Some(Ok(applied)) = self.core.apply_stream.next() => {
                        let _ = self.core.handle_applied_entries(applied)?;
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        let _ = self.core.lifecycle.transition(LifeCycleState::Closing);
                        self.core.set_target_role(Role::Shutdown);
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower role.
pub(self) struct FollowerState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    core: &'a mut ServerCore<D, R, T, L, M>,
}

impl<'a, D, R, T, L, M> FollowerState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    pub(self) fn new(core: &'a mut ServerCore<D, R, T, L, M>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_role="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_role.is_follower() {
                return Ok(());
            }
            // Value is updated as heartbeats are received.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => self.core.set_target_role(Role::Candidate),
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot(rpc).await);
                        }
                        RaftMsg::ClientRequest { rpc, tx } => {
                            self.core.handle_nonleader_client_request(rpc, tx);
                        }
                        RaftMsg::Initialize { tx, .. } => {
                            let _ = tx.send(Err(crate::error::InitializeError::NotAllowed));
                        }
                        RaftMsg::SetConfiguration { tx, .. } => {
                            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.core.state.leader_id())));
                        }
                        RaftMsg::GetGroupInfo { tx } => {
                            self.core.handle_group_info(tx);
                        }
                    }
                },
                Some(event) = self.core.rx_snapshot.recv() => self.core.handle_snapshot_event(event).await?,
                Some(Ok(applied)) = self.core.apply_stream.next() => {
                    let _ = self.core.handle_applied_entries(applied)?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    let _ = self.core.lifecycle.transition(LifeCycleState::Closing);
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in the starting role.
///
/// A starting node replicates entries from a bootstrapping leader but neither votes nor
/// times out; the lifecycle moves to `Running` on the first AppendEntries that is not
/// flagged as initializing, or through an explicit `initialize`.
pub(self) struct StartingState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    core: &'a mut ServerCore<D, R, T, L, M>,
}

impl<'a, D, R, T, L, M> StartingState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    pub(self) fn new(core: &'a mut ServerCore<D, R, T, L, M>) -> Self {
        Self { core }
    }

    /// Run the starting loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_role="starting"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_role.is_starting() {
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:StartingState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            // Votes are only served while Running.
                            if self.core.lifecycle.is_running() {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            } else {
                                let _ = tx.send(Err(RaftError::NotReady));
                            }
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot(rpc).await);
                        }
                        RaftMsg::ClientRequest { rpc, tx } => {
                            if self.core.lifecycle.is_running() {
                                self.core.handle_nonleader_client_request(rpc, tx);
                            } else {
                                self.core.reject_client_request_not_ready(rpc, tx);
                            }
                        }
                        RaftMsg::Initialize { members, tx } => {
                            let _ = tx.send(self.handle_init_with_config(members).await);
                        }
                        RaftMsg::SetConfiguration { tx, .. } => {
                            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.core.state.leader_id())));
                        }
                        RaftMsg::GetGroupInfo { tx } => {
                            self.core.handle_group_info(tx);
                        }
                    }
                },
                Some(event) = self.core.rx_snapshot.recv() => self.core.handle_snapshot_event(event).await?,
                Some(Ok(applied)) = self.core.apply_stream.next() => {
                    let _ = self.core.handle_applied_entries(applied)?;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    let _ = self.core.lifecycle.transition(LifeCycleState::Closing);
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}
