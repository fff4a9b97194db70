//! The apply loop: drains committed entries into the state machine in index order.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::ServerCore;
use crate::error::ClientException;
use crate::error::RaftResult;
use crate::raft::ClientReply;
use crate::raft::EntryPayload;
use crate::raft::MembershipConfig;
use crate::state_machine::TransactionContext;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::ClientId;
use crate::LogId;
use crate::RaftLog;
use crate::RaftTransport;
use crate::StateMachine;
use crate::Update;

/// The outcome of applying one committed entry, reported back to the core task.
pub(crate) enum AppliedEntry<R: AppDataResponse> {
    /// A blank no-op; the state machine was notified of the index.
    Blank { log_id: LogId },
    /// A client transaction, with the state machine's response or failure.
    Normal {
        log_id: LogId,
        client_id: ClientId,
        call_id: CallId,
        result: Result<R, String>,
    },
    /// A configuration entry; its commit finalizes the configuration view.
    Config { log_id: LogId, membership: MembershipConfig },
    /// A purged marker below a snapshot.
    Purged { log_id: LogId },
}

/// What the core folded out of one applied entry, for role-specific post-processing.
pub(crate) struct AppliedSummary {
    pub log_id: LogId,
    pub config: Option<MembershipConfig>,
}

impl<D, R, T, L, M> ServerCore<D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Hand every newly committed entry to the apply stream.
    ///
    /// Entries are read back and applied off the core task; batches resolve in order, so
    /// the state machine observes entries strictly by index.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn drive_apply(&mut self) -> RaftResult<()> {
        let commit_index = self.state.commit_index();
        if commit_index <= self.last_enqueued_apply {
            return Ok(());
        }
        let start = self.last_enqueued_apply + 1;
        self.last_enqueued_apply = commit_index;

        // Reuse the leader-staged transaction contexts for entries this peer originated.
        let mut ctxs: BTreeMap<u64, TransactionContext<D>> = BTreeMap::new();
        for index in start..=commit_index {
            if let Some(ctx) = self.pending_requests.take_ctx(index) {
                ctxs.insert(index, ctx);
            }
        }

        let log = self.log.clone();
        let sm = self.state_machine.clone();
        let handle = tokio::spawn(
            apply_batch::<D, R, L, M>(log, sm, start, commit_index, ctxs)
                .instrument(tracing::debug_span!("apply", start, commit_index)),
        );
        self.apply_stream.push(handle);
        Ok(())
    }

    /// Fold a resolved apply batch back into the core: advance `last_applied`, complete
    /// retry cache entries and pending requests, and surface configuration commits.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) fn handle_applied_entries(
        &mut self,
        res: anyhow::Result<Vec<AppliedEntry<R>>>,
    ) -> RaftResult<Vec<AppliedSummary>> {
        let applied = res.map_err(|err| self.map_fatal_storage_error(err))?;

        let mut summaries = Vec::with_capacity(applied.len());
        for entry in applied {
            match entry {
                AppliedEntry::Blank { log_id } | AppliedEntry::Purged { log_id } => {
                    self.state.last_applied = log_id;
                    summaries.push(AppliedSummary { log_id, config: None });
                }
                AppliedEntry::Normal {
                    log_id,
                    client_id,
                    call_id,
                    result,
                } => {
                    self.state.last_applied = log_id;
                    let key = (client_id.clone(), call_id);
                    let commit_infos = self.commit_infos_snapshot();
                    let reply = match result {
                        Ok(data) => {
                            Arc::new(ClientReply::success(client_id, call_id, log_id.index, Some(data), commit_infos))
                        }
                        Err(message) => Arc::new(ClientReply::failure(
                            client_id,
                            call_id,
                            log_id.index,
                            ClientException::StateMachineFailure { message },
                            commit_infos,
                        )),
                    };
                    self.pending_requests.resolve(log_id.index);
                    self.retry_cache.complete(key, reply);
                    summaries.push(AppliedSummary { log_id, config: None });
                }
                AppliedEntry::Config { log_id, membership } => {
                    self.state.last_applied = log_id;
                    summaries.push(AppliedSummary {
                        log_id,
                        config: Some(membership),
                    });
                }
            }
        }

        self.report_metrics(Update::Ignore);
        self.trigger_log_compaction_if_needed(false);
        Ok(summaries)
    }
}

/// Apply one contiguous batch of committed entries to the state machine.
///
/// Only state machine failures on a transaction are captured per entry; a storage error
/// reading the batch back is fatal to the core.
async fn apply_batch<D, R, L, M>(
    log: Arc<L>,
    sm: Arc<M>,
    start: u64,
    end: u64,
    mut ctxs: BTreeMap<u64, TransactionContext<D>>,
) -> anyhow::Result<Vec<AppliedEntry<R>>>
where
    D: AppData,
    R: AppDataResponse,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    let entries = log.get_log_entries(start..=end).await?;

    let mut applied = Vec::with_capacity(entries.len());
    for entry in entries {
        let log_id = entry.log_id;
        match entry.payload {
            EntryPayload::Blank => {
                if let Err(err) = sm.notify_index_update(log_id.term, log_id.index).await {
                    tracing::warn!(error=%err, index = log_id.index, "state machine error on index notification");
                }
                applied.push(AppliedEntry::Blank { log_id });
            }
            EntryPayload::Normal(sme) => {
                let mut ctx = ctxs
                    .remove(&log_id.index)
                    .unwrap_or_else(|| TransactionContext::new(sme.client_id.clone(), sme.call_id, sme.data.clone()));
                ctx.log_id = log_id;

                let result = match sm.apply_transaction_serial(&ctx).await {
                    Ok(()) => sm.apply_transaction(ctx).await.map_err(|err| err.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                if let Err(message) = &result {
                    tracing::warn!(index = log_id.index, %message, "state machine failed a transaction");
                }
                applied.push(AppliedEntry::Normal {
                    log_id,
                    client_id: sme.client_id,
                    call_id: sme.call_id,
                    result,
                });
            }
            EntryPayload::ConfigChange(conf) => {
                applied.push(AppliedEntry::Config {
                    log_id,
                    membership: conf.membership,
                });
            }
            EntryPayload::PurgedMarker => {
                applied.push(AppliedEntry::Purged { log_id });
            }
        }
    }
    Ok(applied)
}

impl<'a, D, R, T, L, M> LeaderState<'a, D, R, T, L, M>
where
    D: AppData,
    R: AppDataResponse,
    T: RaftTransport<D>,
    L: RaftLog<D>,
    M: StateMachine<D, R>,
{
    /// Leader-side post-processing of an apply batch: readiness, configuration commit
    /// progression and watch resolution.
    #[tracing::instrument(level = "trace", skip(self, summaries))]
    pub(super) async fn post_apply(&mut self, summaries: Vec<AppliedSummary>) -> crate::error::RaftResult<()> {
        for summary in summaries {
            // The first committed entry of the leader's own term marks leader
            // completeness; from here on reads and writes are admitted.
            if !self.ready && summary.log_id.term == self.core.state.current_term() {
                tracing::info!(id = self.core.id, "leader is ready, committed an entry of its own term");
                self.ready = true;
            }

            if let Some(ref membership) = summary.config {
                let resolved = self
                    .conf_change_response
                    .as_ref()
                    .map(|resp| resp.final_index == Some(summary.log_id.index))
                    .unwrap_or(false);
                if resolved {
                    if let Some(resp) = self.conf_change_response.take() {
                        let _ = resp.tx.send(Ok(summary.log_id.index));
                    }
                }

                if membership.is_in_joint_consensus() {
                    self.handle_joint_consensus_committed().await?;
                } else {
                    self.handle_uniform_consensus_committed(summary.log_id.index);
                }
            }
        }

        self.check_watches();
        self.leader_report_metrics();
        Ok(())
    }
}
