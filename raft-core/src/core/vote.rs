use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::Role;
use crate::core::ServerCore;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::lifecycle::LifeCycleState;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
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
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.group_id != self.config.group_id {
            return Err(RaftError::GroupMismatch {
                expected: self.config.group_id.clone(),
                got: req.group_id,
            });
        }

        // Votes are withheld from disruptive candidates: a current leader ignores
        // campaigns at its own term or below, and a follower with a live leader ignores
        // campaigns entirely (§6 / pre-vote style stability).
        let withhold = (self.target_role.is_leader() && req.term <= self.state.current_term())
            || (self.target_role.is_follower() && self.heard_from_leader_recently());
        if withhold {
            tracing::debug!(
                { candidate = req.candidate_id },
                "withholding vote, a valid leader is live"
            );
            return Ok(VoteResponse {
                term: self.state.current_term(),
                vote_granted: false,
                should_shutdown: self.stale_peer_hint(req.candidate_id, req.last_log_id),
            });
        }

        let metadata_before = self.state.metadata();
        let mut vote_granted = false;

        if self.state.recognize_candidate(req.candidate_id, req.term) {
            // A recognized campaign always demotes to follower with a fresh timer, even
            // if already a follower.
            self.change_to_follower(req.term);

            if self.state.is_log_up_to_date(req.last_log_id) {
                self.state.grant_vote(req.candidate_id);
                self.update_next_election_timeout(false);
                vote_granted = true;
            }
        }

        let should_shutdown = !vote_granted && self.stale_peer_hint(req.candidate_id, req.last_log_id);

        if self.state.metadata() != metadata_before {
            self.save_metadata().await?;
        }
        self.report_metrics(Update::Ignore);

        tracing::debug!(
            { candidate = req.candidate_id, vote_granted, should_shutdown },
            "vote request handled"
        );
        Ok(VoteResponse {
            term: self.state.current_term(),
            vote_granted,
            should_shutdown,
        })
    }

    /// Whether a rejected candidate should be hinted to shut itself down.
    ///
    /// True iff this peer leads with a committed, stable config that excludes the
    /// candidate, and the candidate's log predates the config entry — so it is a removed
    /// or never-admitted peer, not a member still catching up on the removal.
    fn stale_peer_hint(&self, candidate: NodeId, candidate_last: crate::LogId) -> bool {
        self.target_role.is_leader()
            && self.state.membership.is_stable()
            && self.state.membership_committed()
            && !self.state.membership.contains(&candidate)
            && candidate_last < self.state.membership_log_id
    }

    /// Demote to follower at `term`, adopting the term if newer.
    ///
    /// Unconditional on the current role; the caller is responsible for deciding that the
    /// demotion is warranted.
    pub(super) fn change_to_follower(&mut self, term: u64) {
        self.state.update_current_term(term);
        if !self.target_role.is_follower() && !self.target_role.is_starting() {
            self.set_target_role(Role::Follower);
        }
        self.update_next_election_timeout(false);
    }
}

impl<'a, D, R, T, L, M> CandidateState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Spawn parallel vote requests to all group peers.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members = self.core.state.membership.all_nodes();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        for member in all_members.into_iter().filter(|member| member != &self.core.id) {
            let rpc = VoteRequest::new(
                self.core.state.current_term(),
                self.core.id,
                self.core.config.group_id.clone(),
                self.core.state.last_log_id,
            );
            let (transport, tx_inner) = (self.core.transport.clone(), tx.clone());
            tokio::spawn(
                async move {
                    match transport.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => {
                            tracing::warn!({error=%err, peer=member}, "error while requesting vote from peer")
                        }
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }

    /// Handle a vote response from a peer.
    #[tracing::instrument(level = "trace", skip(self, res, target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // A stale-peer hint means a committed configuration excludes this node; campaign
        // no further and shut down.
        if res.should_shutdown {
            tracing::warn!(
                { peer = target },
                "peer reports this node as removed from the group, shutting down"
            );
            let _ = self.core.lifecycle.transition(LifeCycleState::Closing);
            self.core.set_target_role(Role::Shutdown);
            return Ok(());
        }

        // If peer's term is greater than current term, revert to follower.
        if res.term > self.core.state.current_term() {
            self.core.state.update_current_term(res.term);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
            self.core.save_metadata().await?;
            tracing::debug!("reverting to follower due to greater term observed in VoteResponse");
            return Ok(());
        }

        if !res.vote_granted {
            return Ok(());
        }

        if self.core.state.membership.members.contains(&target) {
            self.votes_granted_old += 1;
        }
        if self
            .core
            .state
            .membership
            .members_after_consensus
            .as_ref()
            .map(|members| members.contains(&target))
            .unwrap_or(false)
        {
            self.votes_granted_new += 1;
        }

        // A strict majority of the current configuration wins; both halves must agree
        // while a joint configuration is staging.
        if self.votes_granted_old >= self.votes_needed_old && self.votes_granted_new >= self.votes_needed_new {
            tracing::debug!("transitioning to leader state as minimum number of votes have been received");
            self.core.set_target_role(Role::Leader);
        }
        Ok(())
    }
}
