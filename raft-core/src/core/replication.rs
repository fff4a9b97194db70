//! Leader-side handling of appender lifecycle and feedback.

use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::Role;
use crate::core::SnapshotState;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::lifecycle::LifeCycleState;
use crate::quorum;
use crate::replication::AppenderEvent;
use crate::replication::AppenderFeedback;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftLog;
use crate::RaftTransport;
use crate::StateMachine;

impl<'a, D, R, T, L, M> LeaderState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Spawn an appender for the target peer.
    ///
    /// `initializing` marks a peer still being staged into the group; its frames carry
    /// the initializing flag until its membership commits.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_appender(&self, target: NodeId, initializing: bool) -> ReplicationState<D> {
        let replstream = ReplicationStream::new::<R, T, L>(
            self.core.id,
            target,
            self.core.state.current_term(),
            self.core.config.clone(),
            self.core.state.last_log_id,
            self.core.state.commit_index(),
            initializing,
            self.core.transport.clone(),
            self.core.log.clone(),
            self.feedback_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a feedback event coming from an appender.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_appender_feedback(&mut self, event: AppenderFeedback<L::SnapshotData>) -> RaftResult<()> {
        match event {
            AppenderFeedback::RateUpdate { target, is_line_rate } => {
                self.handle_rate_update(target, is_line_rate).await;
            }
            AppenderFeedback::Progress {
                target,
                matched,
                follower_commit,
            } => {
                self.handle_progress(target, matched, follower_commit).await?;
            }
            AppenderFeedback::RevertToFollower { target, term } => {
                self.handle_revert_to_follower(target, term).await?;
            }
            AppenderFeedback::NeedsSnapshot { target, tx } => {
                self.handle_needs_snapshot(target, tx).await?;
            }
            AppenderFeedback::Slow { target, elapsed } => {
                tracing::warn!(
                    target,
                    ?elapsed,
                    "follower has not completed an RPC round-trip within the slowness threshold"
                );
            }
            AppenderFeedback::Shutdown => {
                tracing::error!("appender reported a critical storage error, shutting down");
                let _ = self.core.lifecycle.transition(LifeCycleState::Closing);
                self.core.set_target_role(Role::Shutdown);
            }
        }
        Ok(())
    }

    /// A staging peer reaching line rate has caught up enough to join the group.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_rate_update(&mut self, target: NodeId, is_line_rate: bool) {
        if !is_line_rate {
            return;
        }
        if let Some(node) = self.staging_nodes.get_mut(&target) {
            node.is_ready_to_join = true;
            self.continue_staged_membership_change(target).await;
        }
    }

    /// Fold an appender's progress into the leader's view and advance the commit index
    /// as far as the quorum allows.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_progress(&mut self, target: NodeId, matched: LogId, follower_commit: u64) -> RaftResult<()> {
        if let Some(node) = self.nodes.get_mut(&target) {
            node.matched = matched;
            if let Some(index) = node.remove_after_commit {
                if matched.index >= index {
                    tracing::debug!(target, "removing target node from replication pool");
                    if let Some(node) = self.nodes.remove(&target) {
                        let _ = node.replstream.repl_tx.send((AppenderEvent::Terminate, tracing::debug_span!("CH")));
                    }
                    self.leader_metrics.replication.remove(&target);
                }
            }
        } else if let Some(node) = self.staging_nodes.get_mut(&target) {
            node.state.matched = matched;
        } else {
            return Ok(());
        }

        if self.nodes.contains_key(&target) || self.staging_nodes.contains_key(&target) {
            self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });
        }
        self.core.commit_infos.update(target, follower_commit);

        let quorum_index = self.calc_quorum_index();
        self.leader_commit_advance(quorum_index).await?;

        self.check_watches();
        self.leader_report_metrics();
        Ok(())
    }

    /// The log index replicated to a majority of the configuration (both halves while a
    /// joint config is staging).
    pub(super) fn calc_quorum_index(&self) -> u64 {
        let own = self.core.state.last_log_id.index;
        let membership = &self.core.state.membership;

        // A joint half may name peers which are still staging; their progress counts
        // toward that half's quorum or the joint entry could never commit.
        let index_of = |peer: &NodeId| -> u64 {
            if peer == &self.core.id {
                own
            } else {
                self.nodes
                    .get(peer)
                    .map(|node| node.matched.index)
                    .or_else(|| self.staging_nodes.get(peer).map(|node| node.state.matched.index))
                    .unwrap_or(0)
            }
        };

        let quorum_of = |members: &std::collections::BTreeSet<NodeId>| -> u64 {
            let mut indexes: Vec<u64> = members.iter().map(index_of).collect();
            indexes.sort_unstable_by(|a, b| b.cmp(a));
            let needed = quorum::majority_of(indexes.len());
            indexes.get(needed - 1).copied().unwrap_or(0)
        };

        let old_quorum = quorum_of(&membership.members);
        match &membership.members_after_consensus {
            Some(new_members) => old_quorum.min(quorum_of(new_members)),
            None => old_quorum,
        }
    }

    /// Advance the commit index to `quorum_index` if doing so is safe.
    ///
    /// Entries of prior terms are never counted directly; the commit index only moves
    /// once it can cover an entry of this leader's own term (§5.4.2).
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn leader_commit_advance(&mut self, quorum_index: u64) -> RaftResult<()> {
        if self.first_index_of_term == 0 || quorum_index < self.first_index_of_term {
            return Ok(());
        }
        if !self.core.state.update_commit_index(quorum_index) {
            return Ok(());
        }

        let commit_index = self.core.state.commit_index();
        self.core
            .log
            .save_commit_index(commit_index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.commit_infos.update(self.core.id, commit_index);
        self.core.drive_apply()?;

        // Let the appenders carry the new commit index on their next frame.
        let commit_infos = self.core.commit_infos_snapshot();
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                AppenderEvent::UpdateCommitIndex {
                    commit_index,
                    commit_infos: commit_infos.clone(),
                },
                tracing::debug_span!("CH"),
            ));
        }
        for node in self.staging_nodes.values() {
            let _ = node.state.replstream.repl_tx.send((
                AppenderEvent::UpdateCommitIndex {
                    commit_index,
                    commit_infos: commit_infos.clone(),
                },
                tracing::debug_span!("CH"),
            ));
        }
        Ok(())
    }

    /// An appender observed a newer term; this leadership is over.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.state.current_term() {
            tracing::debug!(target, term, "reverting to follower, newer term observed from follower");
            self.core.state.update_current_term(term);
            self.core.save_metadata().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
        }
        Ok(())
    }

    /// Hand the current snapshot to an appender, building one first if none exists.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        target: NodeId,
        tx: tokio::sync::oneshot::Sender<crate::storage::Snapshot<L::SnapshotData>>,
    ) -> RaftResult<()> {
        // A snapshot may already exist that covers the entries the target is missing.
        let current = self
            .core
            .log
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        if let Some(snapshot) = current {
            let _ = tx.send(snapshot);
            return Ok(());
        }

        // No snapshot exists: compaction must run (or finish running) first, and the
        // result is forwarded once its completion broadcast fires.
        self.core.trigger_log_compaction_if_needed(true);
        let mut rx = match &self.core.snapshot_state {
            Some(SnapshotState::Snapshotting { sender, .. }) => sender.subscribe(),
            _ => {
                tracing::warn!(target, "no snapshot available and no compaction in progress");
                return Ok(());
            }
        };

        let log = self.core.log.clone();
        tokio::spawn(
            async move {
                if rx.recv().await.is_err() {
                    return;
                }
                match log.get_current_snapshot().await {
                    Ok(Some(snapshot)) => {
                        let _ = tx.send(snapshot);
                    }
                    Ok(None) => {
                        tracing::warn!("compaction completed but no snapshot was found");
                    }
                    Err(err) => {
                        tracing::error!(error=%err, "error fetching snapshot after compaction");
                    }
                }
            }
            .instrument(tracing::debug_span!("waiting for compaction", target)),
        );
        Ok(())
    }
}
