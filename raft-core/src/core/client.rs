use std::sync::Arc;

use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::Role;
use crate::core::ServerCore;
use crate::core::UpdateCurrentLeader;
use crate::error::ClientException;
use crate::error::RaftResult;
use crate::raft::ClientReply;
use crate::raft::ClientRequest;
use crate::raft::ClientResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::ReplicationLevel;
use crate::raft::RequestKind;
use crate::raft::StateMachineEntry;
use crate::retry_cache::Admission;
use crate::retry_cache::CacheKey;
use crate::state_machine::TransactionContext;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::ClientId;
use crate::LogId;
use crate::RaftLog;
use crate::RaftTransport;
use crate::StateMachine;

/// A watch registered with the leader, resolved once its index reaches the requested
/// replication level.
pub(super) struct WatchRequest<R: AppDataResponse> {
    pub index: u64,
    pub level: ReplicationLevel,
    pub client_id: ClientId,
    pub call_id: CallId,
    pub tx: ClientResponseTx<R>,
}

impl<D, R, T, L, M> ServerCore<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Handle a client request on a peer which is not the leader.
    ///
    /// Stale reads are served locally (that is their point); everything else is turned
    /// away with a leader hint.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) fn handle_nonleader_client_request(&mut self, rpc: ClientRequest<D>, tx: ClientResponseTx<R>) {
        if rpc.group_id != self.config.group_id {
            let exception = ClientException::GroupMismatch {
                expected: self.config.group_id.clone(),
                got: rpc.group_id.clone(),
            };
            let reply = self.client_failure_reply(rpc.client_id, rpc.call_id, exception);
            let _ = tx.send(Ok(reply));
            return;
        }
        match rpc.kind {
            RequestKind::StaleRead { min_index, query } => {
                self.serve_stale_read(rpc.client_id, rpc.call_id, min_index, query, tx);
            }
            _ => {
                let exception = self.not_leader_exception();
                let reply = self.client_failure_reply(rpc.client_id, rpc.call_id, exception);
                let _ = tx.send(Ok(reply));
            }
        }
    }

    /// Reject a client request because the lifecycle forbids serving at all.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) fn reject_client_request_not_ready(&mut self, rpc: ClientRequest<D>, tx: ClientResponseTx<R>) {
        let reply = self.client_failure_reply(rpc.client_id, rpc.call_id, ClientException::NotReady);
        let _ = tx.send(Ok(reply));
    }

    /// Serve a stale read against the local state machine.
    ///
    /// The commit gate runs on the core task; the query itself runs off it.
    #[tracing::instrument(level = "trace", skip(self, query, tx))]
    pub(super) fn serve_stale_read(
        &mut self,
        client_id: ClientId,
        call_id: CallId,
        min_index: u64,
        query: bytes::Bytes,
        tx: ClientResponseTx<R>,
    ) {
        let commit_index = self.state.commit_index();
        if commit_index < min_index {
            let reply = self.client_failure_reply(
                client_id,
                call_id,
                ClientException::StaleRead {
                    min_index,
                    commit_index,
                },
            );
            let _ = tx.send(Ok(reply));
            return;
        }

        let sm = self.state_machine.clone();
        let commit_infos = self.commit_infos_snapshot();
        tokio::spawn(
            async move {
                let reply = match sm.query_stale(query, min_index).await {
                    Ok(data) => ClientReply::success(client_id, call_id, 0, Some(data), commit_infos),
                    Err(err) => ClientReply::failure(
                        client_id,
                        call_id,
                        0,
                        ClientException::StateMachineFailure {
                            message: err.to_string(),
                        },
                        commit_infos,
                    ),
                };
                let _ = tx.send(Ok(Arc::new(reply)));
            }
            .instrument(tracing::debug_span!("stale read query")),
        );
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
    /// Commit the initial entry which new leaders are obligated to create when first
    /// coming to power, per §8.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        // If the group has just formed, and the current index is 0, then commit the
        // current config, else a blank payload.
        let last_index = self.core.state.last_log_id.index;

        let payload: EntryPayload<D> = if last_index == 0 {
            EntryPayload::ConfigChange(crate::raft::EntryConfigChange {
                membership: self.core.state.membership.clone(),
            })
        } else {
            // Complete a partial membership change:
            //
            // A change appends two consecutive membership logs, the joint config and the
            // final config. It is possible only the first one was written or replicated.
            // A new leader seeing only the joint config must append the final config to
            // let the change finish.
            let last_logs = self
                .core
                .log
                .get_log_entries(last_index..=last_index)
                .await
                .map_err(crate::error::RaftError::RaftStorage)?;
            let req = last_logs.first().and_then(|last_log| match &last_log.payload {
                EntryPayload::ConfigChange(conf) if conf.membership.members_after_consensus.is_some() => {
                    Some(EntryPayload::ConfigChange(crate::raft::EntryConfigChange {
                        membership: conf.membership.to_final_config(),
                    }))
                }
                _ => None,
            });

            req.unwrap_or(EntryPayload::Blank)
        };

        let entry = self.append_internal_entry(payload).await?;
        self.first_index_of_term = entry.log_id.index;
        self.replicate_entry(Arc::new(entry)).await?;

        Ok(())
    }

    /// Handle a client request while leader.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_request(&mut self, rpc: ClientRequest<D>, tx: ClientResponseTx<R>) {
        if rpc.group_id != self.core.config.group_id {
            let exception = ClientException::GroupMismatch {
                expected: self.core.config.group_id.clone(),
                got: rpc.group_id.clone(),
            };
            let reply = self.core.client_failure_reply(rpc.client_id, rpc.call_id, exception);
            let _ = tx.send(Ok(reply));
            return;
        }

        match rpc.kind {
            RequestKind::StaleRead { min_index, query } => {
                self.core.serve_stale_read(rpc.client_id, rpc.call_id, min_index, query, tx);
            }
            RequestKind::Read(query) => {
                self.handle_read(rpc.client_id, rpc.call_id, query, tx);
            }
            RequestKind::Watch { index, level } => {
                self.handle_watch(rpc.client_id, rpc.call_id, index, level, tx);
            }
            RequestKind::Write(data) => {
                self.handle_write(rpc.client_id, rpc.call_id, data, tx).await;
            }
        }
    }

    /// Serve a leader-side read.
    ///
    /// The leader-state check does not fence against a racing loss of leadership; see
    /// the documentation on `submit_client_request`.
    #[tracing::instrument(level = "trace", skip(self, query, tx))]
    fn handle_read(&mut self, client_id: ClientId, call_id: CallId, query: bytes::Bytes, tx: ClientResponseTx<R>) {
        if let Some(reply) = self.refuse_if_not_ready(&client_id, call_id) {
            let _ = tx.send(Ok(reply));
            return;
        }

        let sm = self.core.state_machine.clone();
        let commit_infos = self.core.commit_infos_snapshot();
        tokio::spawn(
            async move {
                let reply = match sm.query(query).await {
                    Ok(data) => ClientReply::success(client_id, call_id, 0, Some(data), commit_infos),
                    Err(err) => ClientReply::failure(
                        client_id,
                        call_id,
                        0,
                        ClientException::StateMachineFailure {
                            message: err.to_string(),
                        },
                        commit_infos,
                    ),
                };
                let _ = tx.send(Ok(Arc::new(reply)));
            }
            .instrument(tracing::debug_span!("leader read query")),
        );
    }

    /// Register a watch, or resolve it immediately if the level is already reached.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn handle_watch(
        &mut self,
        client_id: ClientId,
        call_id: CallId,
        index: u64,
        level: ReplicationLevel,
        tx: ClientResponseTx<R>,
    ) {
        let watch = WatchRequest {
            index,
            level,
            client_id,
            call_id,
            tx,
        };
        if self.watch_satisfied(&watch) {
            self.resolve_watch(watch);
        } else {
            self.watches.push(watch);
        }
    }

    /// Handle a client write.
    #[tracing::instrument(level = "trace", skip(self, data, tx))]
    async fn handle_write(&mut self, client_id: ClientId, call_id: CallId, data: D, tx: ClientResponseTx<R>) {
        let key: CacheKey = (client_id.clone(), call_id);

        // A leader that has not yet committed in its own term may still replay an
        // already-completed call; anything else must wait.
        if !self.ready {
            if let Some(reply) = self.core.retry_cache.completed_ok(&key) {
                let _ = tx.send(Ok(reply));
            } else {
                let reply = self.core.client_failure_reply(client_id, call_id, ClientException::LeaderNotReady);
                let _ = tx.send(Ok(reply));
            }
            return;
        }

        // At-most-once: a pending or completed-OK prior attempt absorbs this submission.
        match self.core.retry_cache.admit(key.clone(), tx) {
            Admission::Replay(_) | Admission::AttachedPending => return,
            Admission::New => {}
        }

        // Stage the transaction through the state machine.
        let ctx = match self.core.state_machine.start_transaction(&client_id, call_id, data).await {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::warn!(error=%err, "state machine refused to start a transaction");
                self.fail_cache_entry(key, err.to_string());
                return;
            }
        };

        let ctx = match self.core.state_machine.pre_append_transaction(ctx).await {
            Ok(ctx) => ctx,
            Err(err) => {
                // A state machine that refuses pre-append may hold inconsistent state;
                // fence by stepping down.
                tracing::error!(error=%err, "state machine failed pre-append, leader stepping down");
                self.fail_cache_entry(key, err.to_string());
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.set_target_role(Role::Follower);
                return;
            }
        };

        self.append_transaction(key, ctx).await;
    }

    /// Append a staged transaction to the log and hand it to the appenders.
    #[tracing::instrument(level = "trace", skip(self, ctx))]
    async fn append_transaction(&mut self, key: CacheKey, mut ctx: TransactionContext<D>) {
        let entry = Entry {
            log_id: LogId {
                index: self.core.state.last_log_id.index + 1,
                term: self.core.state.current_term(),
            },
            payload: EntryPayload::Normal(StateMachineEntry {
                client_id: ctx.client_id.clone(),
                call_id: ctx.call_id,
                data: ctx.data.clone(),
            }),
        };

        if let Err(err) = self.core.log.append(&[&entry]).await {
            // The core is going down; answer the attempt before it does.
            self.fail_cache_entry(key, err.to_string());
            let _ = self.core.map_fatal_storage_error(err);
            return;
        }
        self.core.state.last_log_id = entry.log_id;
        ctx.log_id = entry.log_id;

        self.core.pending_requests.enqueue(entry.log_id.index, key, ctx);

        if let Err(err) = self.replicate_entry(Arc::new(entry)).await {
            tracing::error!(error=%err, "error while starting replication of a client write");
        }
        self.leader_report_metrics();
    }

    /// Transform the given payload into an entry, assign an index and term, and append
    /// the entry to the log. Used for entries the leader itself originates (the no-op
    /// and configuration changes).
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_internal_entry(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.state.last_log_id.index + 1,
                term: self.core.state.current_term(),
            },
            payload,
        };
        self.core
            .log
            .append(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.state.last_log_id = entry.log_id;

        // A config entry takes effect as soon as it is appended; any step-down it
        // implies is deferred to its commit (`handle_uniform_consensus_committed`).
        if let EntryPayload::ConfigChange(conf) = &entry.payload {
            self.core.state.update_membership(conf.membership.clone(), entry.log_id);
        }

        self.leader_report_metrics();
        Ok(entry)
    }

    /// Begin the process of replicating the given entry.
    ///
    /// This routine does not wait for the entry to finish replication; once it is
    /// committed to the group, its completion is driven by the apply loop.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn replicate_entry(&mut self, entry: Arc<Entry<D>>) -> RaftResult<()> {
        if self.nodes.is_empty() && self.staging_nodes.is_empty() {
            // No other voters: local durability alone commits the entry.
            let index = entry.log_id.index;
            self.leader_commit_advance(index).await?;
            return Ok(());
        }

        let commit_index = self.core.state.commit_index();
        let commit_infos = self.core.commit_infos_snapshot();
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                crate::replication::AppenderEvent::Replicate {
                    entry: entry.clone(),
                    commit_index,
                    commit_infos: commit_infos.clone(),
                },
                tracing::debug_span!("CH"),
            ));
        }
        for node in self.staging_nodes.values() {
            let _ = node.state.replstream.repl_tx.send((
                crate::replication::AppenderEvent::Replicate {
                    entry: entry.clone(),
                    commit_index,
                    commit_infos: commit_infos.clone(),
                },
                tracing::debug_span!("CH"),
            ));
        }
        Ok(())
    }

    /// Complete the retry cache entry at `key` with a state machine failure.
    pub(super) fn fail_cache_entry(&mut self, key: CacheKey, message: String) {
        let reply = self.core.client_failure_reply(
            key.0.clone(),
            key.1,
            ClientException::StateMachineFailure { message },
        );
        self.core.retry_cache.complete(key, reply);
    }

    /// Whether the not-ready refusal applies, returning the replayable reply if the
    /// retry cache already holds one for this key.
    fn refuse_if_not_ready(&mut self, client_id: &ClientId, call_id: CallId) -> Option<Arc<ClientReply<R>>> {
        if self.ready {
            return None;
        }
        let key: CacheKey = (client_id.clone(), call_id);
        if let Some(reply) = self.core.retry_cache.completed_ok(&key) {
            return Some(reply);
        }
        Some(self.core.client_failure_reply(client_id.clone(), call_id, ClientException::LeaderNotReady))
    }

    //////////////////////////////////////////////////////////////////////////////////////////////
    // Watches ////////////////////////////////////////////////////////////////////////////////////

    /// Whether the watch's replication level has been reached.
    pub(super) fn watch_satisfied(&self, watch: &WatchRequest<R>) -> bool {
        match watch.level {
            ReplicationLevel::Committed => self.core.state.commit_index() >= watch.index,
            ReplicationLevel::MajorityApplied => self.core.state.last_applied.index >= watch.index,
            ReplicationLevel::AllApplied => {
                let id = self.core.id;
                let peers = self.core.state.membership.all_nodes().into_iter().filter(|peer| *peer != id);
                self.core.state.last_applied.index >= watch.index
                    && self.core.commit_infos.all_committed(peers, watch.index)
            }
        }
    }

    fn resolve_watch(&mut self, watch: WatchRequest<R>) {
        let commit_infos = self.core.commit_infos_snapshot();
        let reply = ClientReply::success(watch.client_id, watch.call_id, watch.index, None, commit_infos);
        let _ = watch.tx.send(Ok(Arc::new(reply)));
    }

    /// Resolve every watch whose level has been reached.
    pub(super) fn check_watches(&mut self) {
        if self.watches.is_empty() {
            return;
        }
        let watches = std::mem::take(&mut self.watches);
        for watch in watches {
            if self.watch_satisfied(&watch) {
                self.resolve_watch(watch);
            } else {
                self.watches.push(watch);
            }
        }
    }

    /// Fail every registered watch with the given exception.
    pub(super) fn fail_watches(&mut self, exception: ClientException) {
        for watch in std::mem::take(&mut self.watches) {
            let reply = self.core.client_failure_reply(watch.client_id, watch.call_id, exception.clone());
            let _ = watch.tx.send(Ok(reply));
        }
    }
}
