//! Leader-side appenders: one replication worker per follower.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::commit_info::CommitInfo;
use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendResult;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResult;
use crate::raft::SnapshotChunk;
use crate::raft::SnapshotNotification;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftLog;
use crate::RaftTransport;

/// The replication progress of a single follower, as published in leader metrics.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The public handle to a spawned appender.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the appender task.
    pub repl_tx: mpsc::UnboundedSender<(AppenderEvent<D>, Span)>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Create a new appender for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<R: AppDataResponse, T: RaftTransport<D>, L: RaftLog<D>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        initializing: bool,
        transport: Arc<T>,
        log: Arc<L>,
        feedback_tx: mpsc::UnboundedSender<(AppenderFeedback<L::SnapshotData>, Span)>,
    ) -> Self {
        AppenderCore::<D, R, T, L>::spawn(
            id,
            target,
            term,
            config,
            last_log,
            commit_index,
            initializing,
            transport,
            log,
            feedback_tx,
        )
    }
}

/// A task responsible for streaming AppendEntries to one follower.
///
/// Requests to a target are never stacked, as that could result in out-of-order
/// delivery. Entries are buffered until a success response arrives, then the next
/// payload is sent from the buffer.
struct AppenderCore<D: AppData, R: AppDataResponse, T: RaftTransport<D>, L: RaftLog<D>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target follower.
    target: NodeId,
    /// The term of the leadership this appender serves; it never changes during the
    /// lifetime of this task.
    term: u64,

    /// A channel for sending feedback to the leader.
    feedback_tx: mpsc::UnboundedSender<(AppenderFeedback<L::SnapshotData>, Span)>,

    /// A channel for receiving events from the leader.
    repl_rx: mpsc::UnboundedReceiver<(AppenderEvent<D>, Span)>,

    /// The transport used for outbound frames.
    transport: Arc<T>,

    /// The log storage entries are read back from.
    log: Arc<L>,

    /// The server core's runtime config.
    config: Arc<Config>,
    /// The configured max payload entries, simply as a usize.
    max_payload_entries: usize,
    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target pace of this appender.
    target_state: AppenderState,

    /// True while the target peer is still being bootstrapped into the group.
    initializing: bool,

    /// The index of the log entry most recently appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,
    /// The committed indices of group peers, forwarded with every frame.
    commit_infos: Vec<CommitInfo>,

    /// The index of the next log to send.
    ///
    /// Initialized to the leader's last log index + 1. If a follower's log is
    /// inconsistent with the leader's, the consistency check fails and the follower's
    /// reply carries the next index to resume from; this appender walks `next_index` down
    /// accordingly until the logs match.
    next_index: u64,
    /// The last log known to be successfully replicated on the target.
    matched: LogId,

    /// A buffer of entries hot off the leader, pending replication.
    replication_buffer: Vec<Arc<Entry<D>>>,
    /// A buffer of entries which are currently in flight to the follower.
    ///
    /// Entries remain here until the follower confirms the payload, allowing
    /// retransmission in the face of transient errors.
    outbound_buffer: Vec<OutboundEntry<D>>,

    /// The heartbeat interval for ensuring that heartbeats are always delivered in a
    /// timely fashion.
    heartbeat: Interval,
    /// The timeout duration for heartbeats.
    heartbeat_timeout: Duration,
    /// The timeout for sending one snapshot segment.
    install_snapshot_timeout: Duration,

    /// The last time a round-trip to the target completed.
    last_contact: Instant,
    /// Set once a slowness report has been emitted, cleared on contact.
    reported_slow: bool,
}

impl<D: AppData, R: AppDataResponse, T: RaftTransport<D>, L: RaftLog<D>> AppenderCore<D, R, T, L> {
    /// Spawn a new appender task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        initializing: bool,
        transport: Arc<T>,
        log: Arc<L>,
        feedback_tx: mpsc::UnboundedSender<(AppenderFeedback<L::SnapshotData>, Span)>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            transport,
            log,
            config,
            max_payload_entries,
            marker_r: std::marker::PhantomData,
            target_state: AppenderState::Lagging,
            initializing,
            last_log_index: last_log.index,
            commit_index,
            commit_infos: Vec::new(),
            next_index: last_log.index + 1,
            matched: last_log,
            feedback_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
            last_contact: Instant::now(),
            reported_slow: false,
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, group=%self.config.group_id))]
    async fn main(mut self) {
        // Perform an initial heartbeat.
        self.send_append_entries().await;

        loop {
            match &self.target_state {
                AppenderState::LineRate => self.line_rate_loop().await,
                AppenderState::Lagging => self.lagging_loop().await,
                AppenderState::Snapshotting => self.snapshotting_loop().await,
                AppenderState::Shutdown => return,
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// This request will timeout if no response is received within the configured
    /// heartbeat interval.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = repl_len.min(self.max_payload_entries);
                self.outbound_buffer.extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            group_id: self.config.group_id.clone(),
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            commit_infos: self.commit_infos.clone(),
            initializing: self.initializing,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
        };

        tracing::debug!("start sending append_entries, timeout: {:?}", self.heartbeat_timeout);
        let res = match timeout(
            self.heartbeat_timeout,
            self.transport.send_append_entries(self.target, payload),
        )
        .await
        {
            Ok(outer_res) => match outer_res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                    self.check_slowness();
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                self.check_slowness();
                return;
            }
        };
        self.observe_contact();

        let last_log_id = self.outbound_buffer.last().map(|last| last.as_ref().log_id);

        match res.result {
            AppendResult::Success => {
                // Once we've successfully sent a payload of entries, don't send them again.
                self.outbound_buffer.clear();

                tracing::debug!("append entries succeeded to {:?}", last_log_id);

                if let Some(log_id) = last_log_id {
                    self.next_index = log_id.index + 1;
                    self.matched = log_id;
                }
                let _ = self.feedback_tx.send((
                    AppenderFeedback::Progress {
                        target: self.target,
                        matched: self.matched,
                        follower_commit: res.follower_commit,
                    },
                    tracing::debug_span!("CH"),
                ));

                // If our outbound requests have accumulated too much while at line
                // rate, purge and transition to lagging; the target is not able to
                // replicate data fast enough.
                let is_lagging = self
                    .last_log_index
                    .checked_sub(self.matched.index)
                    .map(|diff| diff > self.config.replication_lag_threshold)
                    .unwrap_or(false);
                if is_lagging {
                    self.target_state = AppenderState::Lagging;
                }
            }
            AppendResult::NotLeader => {
                tracing::debug!({ res.term }, "append entries failed, reverting to follower");
                let _ = self.feedback_tx.send((
                    AppenderFeedback::RevertToFollower {
                        target: self.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.target_state = AppenderState::Shutdown;
            }
            AppendResult::Inconsistency => {
                tracing::debug!(res.next_index, "append entries failed, walking next_index down");
                self.handle_inconsistency(res.next_index, res.follower_commit).await;
            }
        }
    }

    /// Adopt the follower's `next_index` estimate after a failed consistency check.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_inconsistency(&mut self, reply_next_index: u64, follower_commit: u64) {
        // In-flight entries no longer line up with the resume point.
        self.outbound_buffer.clear();

        // A next_index above the leader's own log is a logical error from the target;
        // take no action and let the next round-trip sort it out.
        if reply_next_index > self.last_log_index + 1 {
            return;
        }
        self.next_index = reply_next_index.max(1);

        if self.next_index == 1 {
            // The follower holds nothing; resume from the very start.
            self.matched = LogId::default();
            self.target_state = AppenderState::Lagging;
            self.send_progress(follower_commit);
            return;
        }

        // Fetch the entry preceding next_index to learn the term to pair with it.
        let prev = match self.log.try_get_log_entry(self.next_index - 1).await {
            Ok(prev) => prev,
            Err(err) => {
                tracing::error!(error=?err, "error fetching log entry for inconsistency handling");
                let _ = self.feedback_tx.send((AppenderFeedback::Shutdown, tracing::debug_span!("CH")));
                self.target_state = AppenderState::Shutdown;
                return;
            }
        };

        match prev {
            Some(entry) => {
                self.matched = entry.log_id;
                self.target_state = AppenderState::Lagging;
            }
            None => {
                // The entry was purged by log compaction; the follower needs a snapshot.
                self.target_state = AppenderState::Snapshotting;
            }
        }
        self.send_progress(follower_commit);
    }

    fn send_progress(&mut self, follower_commit: u64) {
        let _ = self.feedback_tx.send((
            AppenderFeedback::Progress {
                target: self.target,
                matched: self.matched,
                follower_commit,
            },
            tracing::debug_span!("CH"),
        ));
    }

    /// Report the target as slow once its silence outgrows `rpc_slowness_timeout`.
    fn check_slowness(&mut self) {
        let elapsed = self.last_contact.elapsed();
        if !self.reported_slow && elapsed >= Duration::from_millis(self.config.rpc_slowness_timeout) {
            self.reported_slow = true;
            let _ = self.feedback_tx.send((
                AppenderFeedback::Slow {
                    target: self.target,
                    elapsed,
                },
                tracing::debug_span!("CH"),
            ));
        }
    }

    fn observe_contact(&mut self) {
        self.last_contact = Instant::now();
        self.reported_slow = false;
    }

    /// Perform a check to see if this appender is lagging behind far enough that a
    /// snapshot is warranted.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn needs_snapshot(&self) -> bool {
        match &self.config.snapshot_policy {
            SnapshotPolicy::LogsSinceLast(threshold) => {
                self.commit_index.checked_sub(self.matched.index).map(|diff| diff >= *threshold).unwrap_or(false)
            }
        }
    }

    /// Fully drain the channel coming in from the leader.
    pub(self) fn drain_leader_rx(&mut self, first: AppenderEvent<D>, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            let _ent = span.enter();

            match event {
                AppenderEvent::UpdateCommitIndex {
                    commit_index,
                    commit_infos,
                } => {
                    self.commit_index = commit_index;
                    self.commit_infos = commit_infos;
                }

                AppenderEvent::Replicate {
                    entry,
                    commit_index,
                    commit_infos,
                } => {
                    self.commit_index = commit_index;
                    self.commit_infos = commit_infos;
                    self.last_log_index = entry.log_id.index;
                    if self.target_state == AppenderState::LineRate {
                        self.replication_buffer.push(entry);
                    }
                }

                AppenderEvent::JoinedMembership => {
                    self.initializing = false;
                }

                AppenderEvent::Terminate => {
                    self.target_state = AppenderState::Shutdown;
                    return;
                }
            }

            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }
}

/// A type which wraps two possible forms of an outbound entry for replication.
enum OutboundEntry<D: AppData> {
    /// An entry owned by an Arc, hot off the leader's append path.
    Arc(Arc<Entry<D>>),
    /// An entry which was fetched directly from storage.
    Raw(Entry<D>),
}

impl<D: AppData> AsRef<Entry<D>> for OutboundEntry<D> {
    fn as_ref(&self) -> &Entry<D> {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The pace of an appender.
#[derive(Eq, PartialEq)]
enum AppenderState {
    /// The appender is running at line rate.
    LineRate,
    /// The appender is lagging behind and feeding from storage.
    Lagging,
    /// The appender is bringing the target past purged entries via a snapshot.
    Snapshotting,
    /// The appender is shutting down.
    Shutdown,
}

/// An event from the leader to an appender.
pub(crate) enum AppenderEvent<D: AppData> {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to the
        /// log, so its index is the new last_log_index value.
        entry: Arc<Entry<D>>,
        /// The index of the highest log entry which is known to be committed.
        commit_index: u64,
        /// The committed indices of group peers as known to the leader.
        commit_infos: Vec<CommitInfo>,
    },
    /// The leader has observed a new commit index.
    UpdateCommitIndex {
        commit_index: u64,
        commit_infos: Vec<CommitInfo>,
    },
    /// The target has been committed into the membership; frames stop carrying the
    /// initializing flag.
    JoinedMembership,
    Terminate,
}

impl<D: AppData> MessageSummary for AppenderEvent<D> {
    fn summary(&self) -> String {
        match self {
            AppenderEvent::Replicate { entry, commit_index, .. } => {
                format!("Replicate: entry: {}, commit_index: {}", entry.summary(), commit_index)
            }
            AppenderEvent::UpdateCommitIndex { commit_index, .. } => {
                format!("UpdateCommitIndex: {}", commit_index)
            }
            AppenderEvent::JoinedMembership => "JoinedMembership".to_string(),
            AppenderEvent::Terminate => "Terminate".to_string(),
        }
    }
}

/// Feedback from an appender to the leader.
pub(crate) enum AppenderFeedback<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// An update to the pace of an appender.
    RateUpdate {
        target: NodeId,
        /// A flag indicating if the corresponding target node is replicating at line rate.
        ///
        /// When not at line rate, the appender feeds from storage and the leader should
        /// not enqueue fresh entries onto it.
        is_line_rate: bool,
    },
    /// The target's match index and commit index advanced.
    Progress {
        target: NodeId,
        /// The most recent log known to have been successfully replicated on the target.
        matched: LogId,
        /// The target's own commit index, as reported in its reply.
        follower_commit: u64,
    },
    /// The target reported a newer term; the leader must revert to follower.
    RevertToFollower { target: NodeId, term: u64 },
    /// The appender needs the current snapshot to bring its target past purged entries.
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// The target has not completed a round-trip within the slowness threshold.
    Slow { target: NodeId, elapsed: Duration },
    /// Some critical error has taken place, and the core needs to shutdown.
    Shutdown,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin + 'static> MessageSummary for AppenderFeedback<S> {
    fn summary(&self) -> String {
        match self {
            AppenderFeedback::RateUpdate { target, is_line_rate } => {
                format!("RateUpdate: target: {}, is_line_rate: {}", target, is_line_rate)
            }
            AppenderFeedback::Progress {
                target,
                matched,
                follower_commit,
            } => {
                format!(
                    "Progress: target: {}, matched: {}, follower_commit: {}",
                    target, matched, follower_commit
                )
            }
            AppenderFeedback::RevertToFollower { target, term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            AppenderFeedback::NeedsSnapshot { target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            AppenderFeedback::Slow { target, elapsed } => {
                format!("Slow: target: {}, elapsed: {:?}", target, elapsed)
            }
            AppenderFeedback::Shutdown => "Shutdown".to_string(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, T: RaftTransport<D>, L: RaftLog<D>> AppenderCore<D, R, T, L> {
    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        let event = AppenderFeedback::RateUpdate {
            target: self.target,
            is_line_rate: true,
        };
        let _ = self.feedback_tx.send((event, tracing::debug_span!("CH")));
        loop {
            if self.target_state != AppenderState::LineRate {
                return;
            }

            // We always prioritize draining our buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().log_id.index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.log_id.index));

            // When converting to lagging, both buffers are cleared, and they may have
            // held uncommitted entries. When converting back to line rate with empty
            // buffers, any such entries must be resent, else they have no chance to be
            // replicated until a new entry is written.
            let index = match next_buf_index {
                Some(i) => i,
                None => self.last_log_index + 1,
            };

            // Ensure that our buffered data matches up with `next_index`. When
            // transitioning to line rate, it is always possible that new data has been
            // sent for replication but has skipped this appender during transition. In
            // such cases, a single update from storage will put this stream back on track.
            if self.next_index != index {
                self.frontload_outbound_buffer(self.next_index, index).await;
                if self.target_state != AppenderState::LineRate {
                    return;
                }

                self.send_append_entries().await;
                continue;
            }

            let span = tracing::debug_span!("CHrx:LineRate");
            let _en = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_leader_rx(event, span),
                        None => self.target_state = AppenderState::Shutdown,
                    }
                }
            }
        }
    }

    /// Ensure there are no gaps in the outbound buffer due to transition from lagging.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        let entries = match self.log.get_log_entries(start..stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error while frontloading outbound buffer");
                let _ = self.feedback_tx.send((AppenderFeedback::Shutdown, tracing::debug_span!("CH")));
                return;
            }
        };

        for entry in entries.iter() {
            if let EntryPayload::PurgedMarker = entry.payload {
                self.target_state = AppenderState::Snapshotting;
                return;
            }
        }

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    pub async fn lagging_loop(&mut self) {
        let event = AppenderFeedback::RateUpdate {
            target: self.target,
            is_line_rate: false,
        };
        let _ = self.feedback_tx.send((event, tracing::debug_span!("CH")));
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.target_state != AppenderState::Lagging {
                return;
            }
            // If this stream is far enough behind, transition to snapshotting state.
            if self.needs_snapshot() {
                self.target_state = AppenderState::Snapshotting;
                return;
            }

            // Prep entries from storage and send them off for replication.
            if self.is_up_to_speed() {
                self.target_state = AppenderState::LineRate;
                return;
            }
            self.prep_outbound_buffer_from_storage().await;
            self.send_append_entries().await;
            if self.is_up_to_speed() {
                self.target_state = AppenderState::LineRate;
                return;
            }

            // Check the leader channel to ensure we are staying up-to-date, then loop.
            if let Some(Some((event, span))) = self.repl_rx.recv().now_or_never() {
                self.drain_leader_rx(event, span);
            }
        }
    }

    /// Check if this appender is now up-to-speed.
    #[tracing::instrument(level = "trace", skip(self))]
    fn is_up_to_speed(&self) -> bool {
        self.next_index > self.commit_index
    }

    /// Prep the outbound buffer with the next payload of entries to append.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        // If the send buffer is empty, we need to fill it.
        if self.outbound_buffer.is_empty() {
            // Underflow is guarded against in the `is_up_to_speed` check in the outer loop.
            let distance_behind = self.commit_index - self.next_index;

            let is_within_payload_distance = distance_behind <= self.config.max_payload_entries;

            let stop_idx = if is_within_payload_distance {
                // If we have caught up to the line index, then that means we will be
                // running at line rate after this payload is successfully replicated.
                self.target_state = AppenderState::LineRate; // Will continue in lagging until the outer loop cycles.
                self.commit_index + 1 // +1 to ensure stop value is included.
            } else {
                self.next_index + self.config.max_payload_entries + 1 // +1 to ensure stop value is included.
            };

            let entries = match self.log.get_log_entries(self.next_index..stop_idx).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error=%err, "error fetching logs from storage");
                    let _ = self.feedback_tx.send((AppenderFeedback::Shutdown, tracing::debug_span!("CH")));
                    self.target_state = AppenderState::Shutdown;
                    return;
                }
            };

            for entry in entries.iter() {
                if let EntryPayload::PurgedMarker = entry.payload {
                    self.target_state = AppenderState::Snapshotting;
                    return;
                }
            }

            self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
        }
    }

    //////////////////////////////////////////////////////////////////////////////////////////////
    // Snapshotting ///////////////////////////////////////////////////////////////////////////////

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    async fn snapshotting_loop(&mut self) {
        let event = AppenderFeedback::RateUpdate {
            target: self.target,
            is_line_rate: false,
        };
        let _ = self.feedback_tx.send((event, tracing::debug_span!("CH")));
        self.replication_buffer.clear();
        self.outbound_buffer.clear();

        loop {
            if self.target_state != AppenderState::Snapshotting {
                return;
            }

            // Ask the leader for the current snapshot; it may need to build one first.
            let (tx, rx) = oneshot::channel();
            let _ = self.feedback_tx.send((
                AppenderFeedback::NeedsSnapshot {
                    target: self.target,
                    tx,
                },
                tracing::debug_span!("CH"),
            ));
            let snapshot = match self.wait_for_snapshot(rx).await {
                Some(snapshot) => snapshot,
                None => {
                    // The leader could not produce a snapshot yet; sit out a beat
                    // rather than hammering it with requests.
                    self.pause_between_notifications().await;
                    continue;
                }
            };

            if self.config.install_snapshot_enabled {
                if let Err(err) = self.stream_snapshot(snapshot).await {
                    tracing::warn!(error=%err, "error streaming snapshot to target");
                }
            } else {
                self.notify_snapshot(snapshot.meta.last_log_id).await;
            }
        }
    }

    /// Wait for a response from the storage layer for the current snapshot.
    ///
    /// Heartbeats are sent in the meantime so that the target does not time out.
    #[tracing::instrument(level = "trace", skip(self, rx))]
    async fn wait_for_snapshot(&mut self, mut rx: oneshot::Receiver<Snapshot<L::SnapshotData>>) -> Option<Snapshot<L::SnapshotData>> {
        loop {
            let span = tracing::debug_span!("CHrx:Snapshotting");
            let _ent = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_leader_rx(event, span),
                        None => {
                            self.target_state = AppenderState::Shutdown;
                            return None;
                        }
                    }
                },

                res = &mut rx => {
                    match res {
                        Ok(snapshot) => return Some(snapshot),
                        Err(_) => return None, // Channels may close for various acceptable reasons.
                    }
                },
            }
        }
    }

    /// Notify-mode install: tell the target which entries are no longer available and
    /// poll until its state machine reports the snapshot installed.
    #[tracing::instrument(level = "trace", skip(self), fields(target=self.target))]
    async fn notify_snapshot(&mut self, snapshot_last: LogId) {
        let first_available = LogId {
            term: snapshot_last.term,
            index: snapshot_last.index + 1,
        };

        loop {
            if self.target_state != AppenderState::Snapshotting {
                return;
            }

            let req = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                group_id: self.config.group_id.clone(),
                payload: SnapshotNotification { first_available }.into(),
            };

            let res = match timeout(
                self.install_snapshot_timeout,
                self.transport.send_install_snapshot(self.target, req),
            )
            .await
            {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot notification to target");
                    self.check_slowness();
                    self.pause_between_notifications().await;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error=%err, "timeout while sending InstallSnapshot notification to target");
                    self.check_slowness();
                    self.pause_between_notifications().await;
                    continue;
                }
            };
            self.observe_contact();

            if res.term > self.term {
                let _ = self.feedback_tx.send((
                    AppenderFeedback::RevertToFollower {
                        target: self.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.target_state = AppenderState::Shutdown;
                return;
            }

            match res.result {
                InstallSnapshotResult::AlreadyInstalled { snapshot_index } => {
                    self.next_index = snapshot_index + 1;
                    self.matched = if snapshot_index == snapshot_last.index {
                        snapshot_last
                    } else {
                        match self.log.try_get_log_entry(snapshot_index).await {
                            Ok(Some(entry)) => entry.log_id,
                            _ => snapshot_last,
                        }
                    };
                    self.send_progress(0);
                    self.target_state = AppenderState::Lagging;
                    return;
                }
                InstallSnapshotResult::Success { .. } | InstallSnapshotResult::InProgress => {
                    // The install is asynchronous on the target; poll again shortly.
                    self.pause_between_notifications().await;
                }
                InstallSnapshotResult::NotLeader => {
                    let _ = self.feedback_tx.send((
                        AppenderFeedback::RevertToFollower {
                            target: self.target,
                            term: res.term,
                        },
                        tracing::debug_span!("CH"),
                    ));
                    self.target_state = AppenderState::Shutdown;
                    return;
                }
                InstallSnapshotResult::ConfMismatch => {
                    tracing::error!(
                        target = self.target,
                        "install mode mismatch between leader and follower config"
                    );
                    self.target_state = AppenderState::Shutdown;
                    return;
                }
            }
        }
    }

    /// Sit out one heartbeat interval between install notifications, keeping the
    /// leader channel drained.
    async fn pause_between_notifications(&mut self) {
        let span = tracing::debug_span!("CHrx:NotifyWait");
        let _ent = span.enter();
        tokio::select! {
            _ = self.heartbeat.tick() => {}
            event_span = self.repl_rx.recv() => {
                match event_span {
                    Some((event, span)) => self.drain_leader_rx(event, span),
                    None => self.target_state = AppenderState::Shutdown,
                }
            }
        }
    }

    /// Chunk-mode install: stream the snapshot's bytes to the target.
    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<L::SnapshotData>) -> RaftResult<()> {
        let end = snapshot.snapshot.seek(SeekFrom::End(0)).await?;

        let mut offset = 0;
        let mut chunk_index = 0;

        self.next_index = snapshot.meta.last_log_id.index + 1;
        self.matched = snapshot.meta.last_log_id;
        let mut buf = Vec::with_capacity(self.config.snapshot_max_chunk_size as usize);

        loop {
            // Build the RPC.
            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            let n_read = snapshot.snapshot.read_buf(&mut buf).await?;

            let done = (offset + n_read as u64) == end; // If bytes read == 0, then we're done.
            let req = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                group_id: self.config.group_id.clone(),
                payload: SnapshotChunk {
                    meta: snapshot.meta.clone(),
                    offset,
                    chunk_index,
                    data: Vec::from(&buf[..n_read]),
                    done,
                }
                .into(),
            };
            buf.clear();

            // Send the RPC over to the target.
            tracing::debug!(snapshot_size = n_read, offset, end, done, "sending snapshot chunk");

            let res = timeout(
                self.install_snapshot_timeout,
                self.transport.send_install_snapshot(self.target, req),
            )
            .await;

            let res = match res {
                Ok(outer_res) => match outer_res {
                    Ok(res) => res,
                    Err(err) => {
                        tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                        continue;
                    }
                },
                Err(err) => {
                    tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                    continue;
                }
            };
            self.observe_contact();

            // Handle response conditions.
            if res.term > self.term {
                let _ = self.feedback_tx.send((
                    AppenderFeedback::RevertToFollower {
                        target: self.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.target_state = AppenderState::Shutdown;
                return Ok(());
            }
            match res.result {
                InstallSnapshotResult::ConfMismatch => {
                    tracing::error!(
                        target = self.target,
                        "install mode mismatch between leader and follower config"
                    );
                    self.target_state = AppenderState::Shutdown;
                    return Ok(());
                }
                InstallSnapshotResult::AlreadyInstalled { snapshot_index } => {
                    // The target already covers this snapshot; no need to finish the
                    // transfer.
                    self.next_index = snapshot_index + 1;
                    self.target_state = AppenderState::Lagging;
                    return Ok(());
                }
                _ => {}
            }

            // If we just sent the final chunk of the snapshot, then transition to lagging.
            if done {
                self.target_state = AppenderState::Lagging;
                return Ok(());
            }

            // Everything is good, so update offset for sending the next chunk.
            offset += n_read as u64;
            chunk_index += 1;

            // Check the leader channel to ensure we are staying up-to-date, then loop.
            if let Some(Some((event, span))) = self.repl_rx.recv().now_or_never() {
                self.drain_leader_rx(event, span);
            }
        }
    }
}
