//! Public Raft server interface and data types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::commit_info::CommitInfo;
use crate::config::Config;
use crate::core::Role;
use crate::core::ServerCore;
use crate::error::ChangeConfigError;
use crate::error::ClientException;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::lifecycle::LifeCycle;
use crate::lifecycle::LifeCycleState;
use crate::metrics::ServerMetrics;
use crate::metrics::Wait;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::ClientId;
use crate::GroupId;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftLog;
use crate::RaftTransport;
use crate::StateMachine;

struct RaftInner<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<ServerMetrics>,
    lifecycle: Arc<LifeCycle>,
    core_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_t: std::marker::PhantomData<T>,
    marker_l: std::marker::PhantomData<L>,
    marker_m: std::marker::PhantomData<M>,
}

/// The API handle to a running Raft server core.
///
/// This type spawns the core as a task on creation and is the interface through which
/// the enclosing process delivers inbound RPCs, submits client requests and drives
/// administrative operations.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very
/// cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns `RaftError::ShuttingDown`, the core is on its way to
/// `Closed` (potentially for data safety reasons after a metadata persist failure) and
/// `shutdown` should be called to await it.
pub struct RaftServer<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    inner: Arc<RaftInner<D, R, T, L, M>>,
}

impl<D, R, T, L, M> RaftServer<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Create and spawn a new Raft server core task.
    ///
    /// ### `id`
    /// The ID which the spawned core will use to identify itself within the group. It must
    /// be stable across restarts of the node.
    ///
    /// ### `config`
    /// The runtime config, carrying the group ID this peer serves.
    ///
    /// ### `transport` / `log` / `state_machine`
    /// The collaborators: the RPC transport used for outbound frames, the durable log
    /// storage, and the application state machine.
    #[tracing::instrument(level="trace", skip(config, transport, log, state_machine), fields(group=%config.group_id))]
    pub fn new(id: NodeId, config: Arc<Config>, transport: Arc<T>, log: Arc<L>, state_machine: Arc<M>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ServerMetrics::new_initial(id, config.group_id.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let lifecycle = Arc::new(LifeCycle::new());
        let core_handle = ServerCore::spawn(
            id,
            config,
            transport,
            log,
            state_machine,
            lifecycle.clone(),
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            lifecycle,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_t: std::marker::PhantomData,
            marker_l: std::marker::PhantomData,
            marker_m: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this server (§5.3, heartbeats §5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a RequestVote RPC to this server (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC to this server (§7).
    ///
    /// Depending on the configured install mode, the request either carries a chunk of
    /// snapshot bytes or a notification that the follower must obtain a snapshot itself.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::InstallSnapshot { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a client request to this server.
    ///
    /// Writes are admitted to the at-most-once retry cache keyed by
    /// `(client_id, call_id)`: a duplicate submission of a completed call replays the
    /// cached reply without re-entering the state machine, and a duplicate of an
    /// in-flight call attaches to the pending attempt.
    ///
    /// Client-visible failures (not leader, group mismatch, stale read, state machine
    /// failure, ...) are carried inside the returned reply with `success == false`;
    /// the `Err` variant is reserved for a core which can no longer serve at all.
    ///
    /// A read served by the leader may race a concurrent loss of leadership; no lease
    /// fence is applied, so a read reply is not linearizable with respect to a leader
    /// change that was in flight while it was served.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn submit_client_request(&self, rpc: ClientRequest<D>) -> RaftResult<Arc<ClientReply<R>>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientRequest { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Initialize a pristine Raft node with the given config.
    ///
    /// This command should be called on pristine nodes — where the log index is 0 and the
    /// current term is 0 — as anything else indicates that the group is already formed and
    /// in motion, in which case `InitializeError::NotAllowed` is returned and may safely
    /// be ignored.
    ///
    /// This routine is race-condition free: Raft guarantees that the first node to become
    /// the group leader propagates only its own config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Initialize { members, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Propose a new membership for the group (§6).
    ///
    /// New peers are first added to the transport and brought up to speed through a
    /// staging catch-up round; the group then moves through a joint configuration to the
    /// new one. The returned future resolves once the final configuration entry commits.
    ///
    /// An overlapping reconfiguration, or one proposed while the current configuration
    /// entry is not yet committed, is rejected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_configuration(&self, members: BTreeSet<NodeId>) -> Result<(), ChangeConfigError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::SetConfiguration { members, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        let res = match rx.await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!("recv rx error: {}", err);
                return Err(ChangeConfigError::RaftError(RaftError::ShuttingDown));
            }
        };
        res?;
        Ok(())
    }

    /// Get a description of the group as seen by this peer: its role, the known commit
    /// infos of every peer, and the group composition.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_group_info(&self) -> RaftResult<GroupInfo> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::GetGroupInfo { tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Get the ID of the current leader from this server.
    ///
    /// The value is taken from the metrics channel, which does a good job of staying
    /// up-to-date; it is perfect for routing decisions but is not a leadership guarantee.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// The current lifecycle state of the core.
    pub fn lifecycle_state(&self) -> LifeCycleState {
        self.inner.lifecycle.state()
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ServerMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// // wait for log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log").await?;
    ///
    /// // wait for the peer to learn that node-2 leads:
    /// r.wait(None).current_leader(2, "leader").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft server, driving the lifecycle to `Closed`.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D, R, T, L, M> Clone for RaftServer<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientResponseTx<R> = oneshot::Sender<RaftResult<Arc<ClientReply<R>>>>;
pub(crate) type ChangeConfigTx = oneshot::Sender<Result<u64, ChangeConfigError>>;

/// A message coming from the server API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    ClientRequest {
        rpc: ClientRequest<D>,
        tx: ClientResponseTx<R>,
    },
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    SetConfiguration {
        members: BTreeSet<NodeId>,
        tx: ChangeConfigTx,
    },
    GetGroupInfo {
        tx: oneshot::Sender<GroupInfo>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the group leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,
    /// The ID of the group this frame belongs to.
    pub group_id: GroupId,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries are batched for
    /// efficiency, and must form a contiguous run starting at `prev_log_id.index + 1`.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// The committed indices of group peers as known to the leader.
    pub commit_infos: Vec<CommitInfo>,
    /// True while the leader is still bootstrapping the target peer.
    ///
    /// A follower in the `Starting` lifecycle state only moves to `Running` on receipt of
    /// an AppendEntries with this flag unset.
    pub initializing: bool,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The outcome of an AppendEntries RPC as seen by the follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendResult {
    /// The entries were accepted and durably appended.
    Success,
    /// The sender is not recognized as leader; it should step down or update its term.
    NotLeader,
    /// The follower's log does not line up with `prev_log_id`; `next_index` in the
    /// response tells the leader where to resume.
    Inconsistency,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding peer's current term, for the leader to update itself.
    pub term: u64,
    /// The outcome of the request.
    pub result: AppendResult,
    /// The responding peer's commit index.
    pub follower_commit: u64,
    /// The next log index the leader should send to this peer.
    ///
    /// On `Success` this is the index after the last appended entry; on `Inconsistency`
    /// it is the follower's best estimate of where its log diverges.
    pub next_index: u64,
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// Create a new purged marker at the given log id.
    pub fn new_purged_marker(log_id: LogId) -> Self {
        Entry {
            log_id,
            payload: EntryPayload::PurgedMarker,
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }
        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new group leader, marking leader completeness.
    Blank,
    /// A client transaction destined for the state machine.
    #[serde(bound = "D: AppData")]
    Normal(StateMachineEntry<D>),
    /// A config change log entry.
    ConfigChange(EntryConfigChange),
    /// An entry before which all logs are removed.
    PurgedMarker,
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(n) => format!("normal: {}/{}", n.client_id, n.call_id),
            EntryPayload::ConfigChange(c) => {
                format!("config-change: {:?}", c.membership)
            }
            EntryPayload::PurgedMarker => "purged-marker".to_string(),
        }
    }
}

/// A client transaction carried in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMachineEntry<D: AppData> {
    /// The submitting client.
    pub client_id: ClientId,
    /// The client-chosen serial of this call, for at-most-once replay suppression.
    pub call_id: CallId,
    /// The contents of this entry.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A log entry holding a config change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// Details on the group's membership configuration.
    pub membership: MembershipConfig,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The membership configuration of the group.
///
/// While a membership change is staging, the configuration is a joint of the current and
/// the target member sets; a quorum then requires a majority of both halves.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// All members of the Raft group.
    pub members: BTreeSet<NodeId>,
    /// All members of the Raft group after joint consensus is finalized.
    ///
    /// The presence of a value here indicates that the config is in joint consensus.
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
}

impl MembershipConfig {
    /// Get an iterator over all nodes in the current config.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.members.clone();
        if let Some(members) = &self.members_after_consensus {
            all.extend(members);
        }
        all
    }

    /// Check if the given node ID exists in this membership config.
    ///
    /// When in joint consensus, this will check both config groups.
    pub fn contains(&self, x: &NodeId) -> bool {
        self.members.contains(x)
            || if let Some(members) = &self.members_after_consensus {
                members.contains(x)
            } else {
                false
            }
    }

    /// Check to see if the config is currently in joint consensus.
    pub fn is_in_joint_consensus(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// True iff no joint configuration is pending.
    pub fn is_stable(&self) -> bool {
        self.members_after_consensus.is_none()
    }

    /// Create a new initial config containing only the given node ID.
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            members,
            members_after_consensus: None,
        }
    }

    pub fn to_final_config(&self) -> Self {
        match self.members_after_consensus {
            None => self.clone(),
            Some(ref m) => MembershipConfig {
                members: m.clone(),
                members_after_consensus: None,
            },
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The ID of the group the candidate campaigns in.
    pub group_id: GroupId,
    /// The id of the candidate's last log entry (§5.4).
    pub last_log_id: LogId,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, group_id: GroupId, last_log_id: LogId) -> Self {
        Self {
            term,
            candidate_id,
            group_id,
            last_log_id,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
    /// A hint that the candidate is a stale peer which no longer belongs to the group
    /// and may shut itself down.
    pub should_shutdown: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the group leader to bring a lagging follower past purged log entries (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,
    /// The ID of the group this frame belongs to.
    pub group_id: GroupId,
    /// The install payload; its shape must agree with the peer's configured install mode.
    pub payload: InstallSnapshotPayload,
}

/// The two wire shapes of a snapshot install, selected by `Config::install_snapshot_enabled`.
#[derive(Clone, Debug, Serialize, Deserialize, derive_more::From)]
pub enum InstallSnapshotPayload {
    /// A chunk of snapshot bytes streamed by the leader.
    Chunk(SnapshotChunk),
    /// A notification that the follower's state machine must obtain a snapshot itself.
    Notification(SnapshotNotification),
}

/// One chunk of a snapshot under transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// Metadata of the snapshot being transferred.
    pub meta: SnapshotMeta,
    /// The byte offset where this chunk of data is positioned in the snapshot file.
    pub offset: u64,
    /// The ordinal of this chunk within the transfer.
    pub chunk_index: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,
    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

/// A notification that the follower must obtain a snapshot covering at least the log up
/// to `first_available`, the oldest entry the leader can still replicate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SnapshotNotification {
    pub first_available: LogId,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        match &self.payload {
            InstallSnapshotPayload::Chunk(chunk) => format!(
                "term={}, leader_id={}, meta={:?}, offset={}, len={}, done={}",
                self.term,
                self.leader_id,
                chunk.meta,
                chunk.offset,
                chunk.data.len(),
                chunk.done
            ),
            InstallSnapshotPayload::Notification(n) => format!(
                "term={}, leader_id={}, notify first_available={}",
                self.term, self.leader_id, n.first_available
            ),
        }
    }
}

/// The outcome of an InstallSnapshot RPC as seen by the follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallSnapshotResult {
    /// The chunk was installed (chunk mode), or the install was started (notify mode,
    /// `chunk_index == -1`).
    Success { chunk_index: i64 },
    /// The sender is not recognized as leader.
    NotLeader,
    /// A notified install is still in progress; the leader should retry later.
    InProgress,
    /// The follower already holds a snapshot at or past the notified index.
    AlreadyInstalled { snapshot_index: u64 },
    /// The request's payload shape does not match the peer's configured install mode.
    ConfMismatch,
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
    /// The outcome of the request.
    pub result: InstallSnapshotResult,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The replication level a watch request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationLevel {
    /// The index is covered by the leader's commit index.
    Committed,
    /// The index has been applied by the leader (and is therefore majority-durable).
    MajorityApplied,
    /// Every peer of the group has reported a commit index covering the index.
    AllApplied,
}

/// An application specific client request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientRequest<D: AppData> {
    /// The stable identity of the submitting client.
    pub client_id: ClientId,
    /// The client-chosen serial of this call.
    pub call_id: CallId,
    /// The group this request is addressed to.
    pub group_id: GroupId,
    /// What is being requested.
    #[serde(bound = "D: AppData")]
    pub kind: RequestKind<D>,
}

/// The variants of a client request.
#[derive(Debug, Serialize, Deserialize)]
pub enum RequestKind<D: AppData> {
    /// Update the replicated state machine (§5.1). Subject to at-most-once semantics.
    #[serde(bound = "D: AppData")]
    Write(D),
    /// Query the state machine on the leader.
    Read(Bytes),
    /// Query the local state machine, requiring it to have applied at least `min_index`.
    StaleRead { min_index: u64, query: Bytes },
    /// Resolve once `index` has reached the requested replication level on the leader.
    Watch { index: u64, level: ReplicationLevel },
}

impl<D: AppData> ClientRequest<D> {
    pub fn write(client_id: ClientId, call_id: CallId, group_id: GroupId, data: D) -> Self {
        Self {
            client_id,
            call_id,
            group_id,
            kind: RequestKind::Write(data),
        }
    }

    pub fn read(client_id: ClientId, call_id: CallId, group_id: GroupId, query: Bytes) -> Self {
        Self {
            client_id,
            call_id,
            group_id,
            kind: RequestKind::Read(query),
        }
    }

    pub fn stale_read(client_id: ClientId, call_id: CallId, group_id: GroupId, min_index: u64, query: Bytes) -> Self {
        Self {
            client_id,
            call_id,
            group_id,
            kind: RequestKind::StaleRead { min_index, query },
        }
    }

    pub fn watch(client_id: ClientId, call_id: CallId, group_id: GroupId, index: u64, level: ReplicationLevel) -> Self {
        Self {
            client_id,
            call_id,
            group_id,
            kind: RequestKind::Watch { index, level },
        }
    }
}

impl<D: AppData> MessageSummary for ClientRequest<D> {
    fn summary(&self) -> String {
        let kind = match &self.kind {
            RequestKind::Write(_) => "write".to_string(),
            RequestKind::Read(_) => "read".to_string(),
            RequestKind::StaleRead { min_index, .. } => format!("stale-read(min={})", min_index),
            RequestKind::Watch { index, level } => format!("watch({}, {:?})", index, level),
        };
        format!("client={}, call={}, {}", self.client_id, self.call_id, kind)
    }
}

/// The reply to a client request.
///
/// Failures a client is expected to inspect are carried in `exception` with
/// `success == false`; the reply as a whole is what the retry cache stores, so a replay
/// of a completed call observes the identical object.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientReply<R: AppDataResponse> {
    pub client_id: ClientId,
    pub call_id: CallId,
    /// The log index of the processed request; 0 when no entry was appended.
    pub log_index: u64,
    pub success: bool,
    /// The state machine's response, present on successful writes and reads.
    #[serde(bound = "R: AppDataResponse")]
    pub result: Option<R>,
    pub exception: Option<ClientException>,
    /// The committed indices of group peers as known to the replying peer.
    pub commit_infos: Vec<CommitInfo>,
}

impl<R: AppDataResponse> ClientReply<R> {
    pub(crate) fn success(
        client_id: ClientId,
        call_id: CallId,
        log_index: u64,
        result: Option<R>,
        commit_infos: Vec<CommitInfo>,
    ) -> Self {
        Self {
            client_id,
            call_id,
            log_index,
            success: true,
            result,
            exception: None,
            commit_infos,
        }
    }

    pub(crate) fn failure(
        client_id: ClientId,
        call_id: CallId,
        log_index: u64,
        exception: ClientException,
        commit_infos: Vec<CommitInfo>,
    ) -> Self {
        Self {
            client_id,
            call_id,
            log_index,
            success: false,
            result: None,
            exception: Some(exception),
            commit_infos,
        }
    }
}

/// A description of the group as seen by one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: NodeId,
    pub group_id: GroupId,
    pub role: Role,
    pub current_term: u64,
    pub leader: Option<NodeId>,
    pub commit_infos: Vec<CommitInfo>,
    pub membership: MembershipConfig,
}
