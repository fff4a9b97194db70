use crate::core::Role;
use crate::core::ServerCore;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::lifecycle::LifeCycleState;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::AppendResult;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftLog;
use crate::RaftTransport;
use crate::StateMachine;
use crate::Update;

impl<D, R, T, L, M> ServerCore<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as
    /// heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.group_id != self.config.group_id {
            return Err(RaftError::GroupMismatch {
                expected: self.config.group_id.clone(),
                got: req.group_id,
            });
        }
        validate_entry_sequence(&req)?;

        if !self.state.recognize_leader(req.leader_id, req.term) {
            tracing::debug!(
                { leader = req.leader_id, term = req.term },
                "AppendEntries from an unrecognized leader"
            );
            return Ok(AppendEntriesResponse {
                term: self.state.current_term(),
                result: AppendResult::NotLeader,
                follower_commit: self.state.commit_index(),
                next_index: self.state.last_log_id.index + 1,
            });
        }

        // A recognized leader demotes this peer and re-arms its timer; the adopted term
        // is flushed before the reply reveals it.
        let metadata_before = self.state.metadata();
        self.change_to_follower(req.term);
        if self.state.metadata() != metadata_before {
            self.save_metadata().await?;
        }
        if self.state.leader_id() != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            self.report_metrics(Update::Ignore);
        }

        // A peer still in the Starting lifecycle goes Running on the first frame that is
        // not part of group bootstrap, and starts its follower election timer.
        if self.lifecycle.state() == LifeCycleState::Starting
            && !req.initializing
            && self.lifecycle.compare_and_transition(LifeCycleState::Starting, LifeCycleState::Running)
            && self.state.membership.contains(&self.id)
        {
            self.set_target_role(Role::Follower);
        }

        self.update_next_election_timeout(true);

        // Consistency check: find where the leader must resume if this frame does not
        // line up with the local log.
        if let Some(reply_next_index) = self.append_inconsistency(&req).await? {
            self.update_next_election_timeout(true);
            tracing::debug!(reply_next_index, "AppendEntries inconsistency");
            return Ok(AppendEntriesResponse {
                term: self.state.current_term(),
                result: AppendResult::Inconsistency,
                follower_commit: self.state.commit_index(),
                next_index: reply_next_index,
            });
        }

        // Fold configuration entries into the view (uncommitted until commit advances)
        // and the leader's commit knowledge into the cache.
        self.update_membership_from_entries(&req.entries)?;
        self.commit_infos.fold(&req.commit_infos);

        // Reconcile with the local log, then durably append whatever is genuinely new.
        let to_append = self.reconcile_entries(&req.entries).await?;
        if !to_append.is_empty() {
            let refs: Vec<&Entry<D>> = to_append.iter().collect();
            self.log.append(&refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
            if let Some(last) = to_append.last() {
                self.state.last_log_id = last.log_id;
            }
        }

        // Advance the commit index and kick the apply loop.
        self.update_state_machine(req.leader_commit, req.term).await?;

        self.update_next_election_timeout(true);
        self.report_metrics(Update::Ignore);

        Ok(AppendEntriesResponse {
            term: self.state.current_term(),
            result: AppendResult::Success,
            follower_commit: self.state.commit_index(),
            next_index: self.state.last_log_id.index + 1,
        })
    }

    /// Compute the index the leader must resume from, or `None` if the frame is
    /// consistent with the local log.
    async fn append_inconsistency(&mut self, req: &AppendEntriesRequest<D>) -> RaftResult<Option<u64>> {
        let local_next_index = self.state.last_log_id.index + 1;
        let snapshot_index = self.state.latest_snapshot_id().index;

        // A state machine install is underway; nothing may be appended until it settles.
        if self.state.in_progress_snapshot.is_some() {
            return Ok(Some(local_next_index.min(req.prev_log_id.index).max(1)));
        }

        // Entries at or below the snapshot were already compacted away; resume above it.
        if snapshot_index > 0 {
            if let Some(first) = req.entries.first() {
                if first.log_id.index <= snapshot_index {
                    return Ok(Some(snapshot_index + 1));
                }
            }
        }

        // The entry preceding this frame must be present: in the log, or as the last
        // entry covered by the latest (built or installed) snapshot.
        let prev = req.prev_log_id;
        if prev.index > 0 {
            let present = self.log.contains(prev).await.map_err(|err| self.map_fatal_storage_error(err))?
                || prev == self.state.snapshot_last_log_id
                || Some(prev) == self.state.installed_snapshot;
            if !present {
                return Ok(Some(local_next_index.min(prev.index).max(1)));
            }
        }

        Ok(None)
    }

    /// Skip entries the log already holds and truncate a conflicting suffix, returning
    /// the entries that remain to be appended.
    ///
    /// An existing entry agreeing on (term, index) is identical by log matching; one
    /// disagreeing on term invalidates it and everything after it.
    async fn reconcile_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<Vec<Entry<D>>> {
        let mut start = 0;
        for (i, entry) in entries.iter().enumerate() {
            let existing = self
                .log
                .try_get_log_entry(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                Some(existing) if existing.log_id.term == entry.log_id.term => {
                    start = i + 1;
                    continue;
                }
                Some(existing) => {
                    tracing::debug!(
                        index = entry.log_id.index,
                        existing_term = existing.log_id.term,
                        new_term = entry.log_id.term,
                        "truncating conflicting log suffix"
                    );
                    self.log
                        .delete_logs_from(entry.log_id.index..)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    self.state.last_log_id = if entry.log_id.index > 1 {
                        self.log.get_last_log_id().await.map_err(|err| self.map_fatal_storage_error(err))?
                    } else {
                        crate::LogId::default()
                    };
                    break;
                }
                None => break,
            }
        }
        Ok(entries[start.min(entries.len())..].to_vec())
    }

    /// Advance the commit index to `min(leader_commit, last log index)` and hand newly
    /// committed entries to the apply loop.
    pub(super) async fn update_state_machine(&mut self, leader_commit: u64, _my_term: u64) -> RaftResult<()> {
        let new_commit = leader_commit.min(self.state.last_log_id.index);
        if self.state.update_commit_index(new_commit) {
            self.log
                .save_commit_index(self.state.commit_index())
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.commit_infos.update(self.id, self.state.commit_index());
            self.drive_apply()?;
        }
        Ok(())
    }
}

/// Validate that the entries of an AppendEntries frame form a contiguous run starting at
/// `prev_log_id.index + 1`, with no entry's term above the leader's.
fn validate_entry_sequence<D: AppData>(req: &AppendEntriesRequest<D>) -> RaftResult<()> {
    let mut expected = req.prev_log_id.index + 1;
    for entry in &req.entries {
        if entry.log_id.index != expected {
            return Err(RaftError::InvalidEntries(format!(
                "entry index {} does not continue from {}",
                entry.log_id.index,
                expected - 1
            )));
        }
        if entry.log_id.term > req.term {
            return Err(RaftError::InvalidEntries(format!(
                "entry {} carries term {} above the leader term {}",
                entry.log_id.index, entry.log_id.term, req.term
            )));
        }
        expected += 1;
    }
    Ok(())
}
