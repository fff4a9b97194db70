use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::Role;
use crate::core::StagingReplicationState;
use crate::core::StartingState;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::lifecycle::LifeCycleState;
use crate::raft::ChangeConfigTx;
use crate::raft::EntryConfigChange;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::replication::AppenderEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftLog;
use crate::RaftTransport;
use crate::StateMachine;

impl<'a, D, R, T, L, M> StartingState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Handle the admin `initialize` command, forming the group's initial configuration
    /// on a pristine peer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        mut members: BTreeSet<NodeId>,
    ) -> Result<(), InitializeError> {
        if self.core.state.last_log_id.index != 0 || self.core.state.current_term() != 0 {
            tracing::error!(
                last_log_index = self.core.state.last_log_id.index,
                current_term = self.core.state.current_term(),
                "rejecting initialize request, node is not pristine"
            );
            return Err(InitializeError::NotAllowed);
        }

        // Ensure given config contains this node's ID as well.
        if !members.contains(&self.core.id) {
            members.insert(self.core.id);
        }

        // Assign the config as the group membership, in memory only; the first leader
        // commits it as the initial configuration entry.
        let single = members.len() == 1;
        self.core.state.update_membership(
            MembershipConfig {
                members,
                members_after_consensus: None,
            },
            LogId::default(),
        );

        let _ = self.core.lifecycle.compare_and_transition(LifeCycleState::Starting, LifeCycleState::Running);

        // If this node is the only member, become leader without holding an election.
        // Otherwise become a follower whose randomized election timeout paces the first
        // campaign; every member initializes this way and the timeouts stagger the
        // candidacies.
        if single {
            self.core.state.new_candidate_term();
            self.core.set_target_role(Role::Leader);
            self.core.save_metadata().await?;
        } else {
            self.core.set_target_role(Role::Follower);
        }

        Ok(())
    }
}

impl<'a, D, R, T, L, M> LeaderState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Propose a new membership for the group (§6).
    ///
    /// The change is accepted only from a stable, committed configuration with no other
    /// change staging. New peers are added to the transport and caught up as staging
    /// members; the group then moves through a joint configuration to the final one, and
    /// `tx` resolves once the final configuration entry commits.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn set_configuration(&mut self, members: BTreeSet<NodeId>, tx: ChangeConfigTx) {
        // Ensure the group will have at least one node.
        if members.is_empty() {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig));
            return;
        }

        // Only one change may be in motion, and only from a uniform consensus state.
        match &self.consensus_state {
            ConsensusState::Uniform => (),
            ConsensusState::StagingSync { .. } | ConsensusState::Joint { .. } => {
                let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress));
                return;
            }
        }
        if self.conf_change_response.is_some() || !self.core.state.membership.is_stable() {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress));
            return;
        }
        if !self.core.state.membership_committed() {
            let _ = tx.send(Err(ChangeConfigError::ConfigNotCommitted));
            return;
        }

        // A no-op change succeeds immediately.
        if members == self.core.state.membership.members {
            let _ = tx.send(Ok(self.core.state.membership_log_id.index));
            return;
        }

        // Make the new peers addressable before replication to them begins.
        let new_peers: Vec<NodeId> =
            members.difference(&self.core.state.membership.members).copied().collect();
        if !new_peers.is_empty() {
            if let Err(err) = self.core.transport.add_peers(&new_peers).await {
                let _ = tx.send(Err(ChangeConfigError::RaftError(RaftError::RaftNetwork(err))));
                return;
            }
        }

        // Check the proposed config for new peers which still need a catch-up round.
        let mut awaiting = HashSet::new();
        for new_node in new_peers {
            match self.staging_nodes.get(&new_node) {
                Some(node) if node.is_ready_to_join => continue,
                Some(_) => (),
                None => {
                    let state = self.spawn_appender(new_node, true);
                    self.staging_nodes.insert(new_node, StagingReplicationState {
                        state,
                        is_ready_to_join: false,
                    });
                }
            }
            awaiting.insert(new_node);
        }

        // If peers still need to sync, wait for them; the rate-update feedback of each
        // staging appender calls back into this flow as they catch up.
        if !awaiting.is_empty() {
            self.consensus_state = ConsensusState::StagingSync { awaiting, members, tx };
            return;
        }

        if let Err(err) = self.begin_joint_consensus(members, tx).await {
            tracing::error!(error=%err, "error beginning joint consensus");
        }
    }

    /// A staging peer has caught up; proceed with the proposed change once all have.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn continue_staged_membership_change(&mut self, target: NodeId) {
        let proceed = match &mut self.consensus_state {
            ConsensusState::StagingSync { awaiting, .. } => {
                awaiting.remove(&target);
                awaiting.is_empty()
            }
            _ => false,
        };
        if !proceed {
            return;
        }
        if let ConsensusState::StagingSync { members, tx, .. } =
            std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform)
        {
            if let Err(err) = self.begin_joint_consensus(members, tx).await {
                tracing::error!(error=%err, "error beginning joint consensus");
            }
        }
    }

    /// Enter joint consensus: append and replicate the joint configuration entry.
    ///
    /// The final configuration entry follows once the joint entry commits.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn begin_joint_consensus(&mut self, members: BTreeSet<NodeId>, tx: ChangeConfigTx) -> RaftResult<()> {
        if !members.contains(&self.core.id) {
            self.is_stepping_down = true;
        }
        self.consensus_state = ConsensusState::Joint { is_committed: false };
        self.conf_change_response = Some(super::ConfChangeResponse { final_index: None, tx });

        let joint_config = MembershipConfig {
            members: self.core.state.membership.members.clone(),
            members_after_consensus: Some(members),
        };
        let entry = self
            .append_internal_entry(EntryPayload::ConfigChange(EntryConfigChange {
                membership: joint_config,
            }))
            .await?;
        self.replicate_entry(Arc::new(entry)).await?;
        Ok(())
    }

    /// Handle the commitment of a joint consensus configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_joint_consensus_committed(&mut self) -> RaftResult<()> {
        if let ConsensusState::Joint { is_committed, .. } = &mut self.consensus_state {
            *is_committed = true; // Mark as committed.
        }
        // Only proceed to finalize this joint consensus if the config entry is committed.
        if self.consensus_state.is_joint_consensus_safe_to_finalize() {
            self.update_replication_state();
            self.finalize_joint_consensus().await?;
        }
        Ok(())
    }

    /// When the joint membership is committed, a staged peer turns into a follower; move
    /// its replication state from `staging_nodes` to `nodes` and stop flagging its
    /// frames as initializing.
    ///
    /// There are two places in this code base where `nodes` changes: when leadership is
    /// established (all members of the membership config), and when a membership change
    /// commits.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn update_replication_state(&mut self) {
        tracing::debug!("update_replication_state");

        let new_node_ids = self
            .core
            .state
            .membership
            .all_nodes()
            .into_iter()
            .filter(|elem| elem != &self.core.id)
            .collect::<BTreeSet<_>>();

        let old_node_ids = self.core.state.membership.members.clone();
        let node_ids_to_add = new_node_ids.difference(&old_node_ids);

        for node_id in node_ids_to_add {
            // A staged peer that was never caught up would be a protocol bug; spawn a
            // fresh appender for it rather than crash.
            let staging = match self.staging_nodes.remove(node_id) {
                Some(staging) => staging,
                None => {
                    tracing::error!(node_id = %node_id, "joint membership contains a peer that was never staged");
                    StagingReplicationState {
                        state: self.spawn_appender(*node_id, false),
                        is_ready_to_join: true,
                    }
                }
            };
            let _ = staging
                .state
                .replstream
                .repl_tx
                .send((AppenderEvent::JoinedMembership, tracing::debug_span!("CH")));
            self.nodes.insert(*node_id, staging.state);
        }
    }

    /// Finalize the committed joint consensus: cut over to the final membership and
    /// append its configuration entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn finalize_joint_consensus(&mut self) -> RaftResult<()> {
        if !self.consensus_state.is_joint_consensus_safe_to_finalize() {
            tracing::error!("attempted to finalize joint consensus when it was not safe to do so");
            return Ok(());
        }

        // A new leader completing a partial change appends the final config before the
        // joint entry commits; in that case the cut-over already happened.
        if self.core.state.membership.is_stable() {
            self.consensus_state = ConsensusState::Uniform;
            return Ok(());
        }

        let final_config = self.core.state.membership.to_final_config();
        self.consensus_state = ConsensusState::Uniform;

        let entry = self
            .append_internal_entry(EntryPayload::ConfigChange(EntryConfigChange {
                membership: final_config,
            }))
            .await?;
        if let Some(resp) = self.conf_change_response.as_mut() {
            resp.final_index = Some(entry.log_id.index);
        }
        self.replicate_entry(Arc::new(entry)).await?;

        // NOTE WELL: peers which do not exist in the new config keep an active appender
        // until they have replicated the config entry which removes them from the group;
        // at that point the appender is removed (`remove_after_commit`). If an election
        // takes place first, the Raft spec's third safety measure on configuration
        // changes (§6) — vote withholding from live-leader followers — covers the rest.
        Ok(())
    }

    /// Handle the commitment of a uniform (final) configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_uniform_consensus_committed(&mut self, index: u64) {
        // Step down if needed.
        if self.is_stepping_down {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_role(Role::Starting);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        // Remove appenders for peers which have replicated this config & are no longer
        // members. Those which have not yet replicated it are marked for removal once
        // they do.
        let membership = &self.core.state.membership;
        let nodes_to_remove: Vec<_> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !membership.contains(id))
            .filter_map(|(id, replstate)| {
                if replstate.matched.index >= index {
                    Some(*id)
                } else {
                    replstate.remove_after_commit = Some(index);
                    None
                }
            })
            .collect();

        tracing::debug!(?nodes_to_remove, "membership: {:?}", self.core.state.membership);

        for target in nodes_to_remove {
            tracing::debug!(target, "removing target node from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((AppenderEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }
        self.leader_report_metrics();
    }
}
