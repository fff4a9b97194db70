use std::io::SeekFrom;

use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::core::ServerCore;
use crate::core::SnapshotEvent;
use crate::core::SnapshotState;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotPayload;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::InstallSnapshotResult;
use crate::raft::SnapshotChunk;
use crate::raft::SnapshotNotification;
use crate::raft_types::SnapshotSegmentId;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
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
    /// An RPC invoked by the leader to bring a follower past purged log entries (§7).
    ///
    /// The configured install mode selects the accepted payload shape: chunked snapshot
    /// bytes written through storage, or a notification handed to the state machine which
    /// obtains the snapshot itself. A mismatched shape replies `ConfMismatch`.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        if req.group_id != self.config.group_id {
            return Err(RaftError::GroupMismatch {
                expected: self.config.group_id.clone(),
                got: req.group_id,
            });
        }

        if !self.state.recognize_leader(req.leader_id, req.term) {
            return Ok(InstallSnapshotResponse {
                term: self.state.current_term(),
                result: InstallSnapshotResult::NotLeader,
            });
        }

        let metadata_before = self.state.metadata();
        self.change_to_follower(req.term);
        if self.state.metadata() != metadata_before {
            self.save_metadata().await?;
            self.report_metrics(Update::Ignore);
        }
        if self.state.leader_id() != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            self.report_metrics(Update::Ignore);
        }
        self.update_next_election_timeout(true);

        let res = match (self.config.install_snapshot_enabled, req.payload) {
            (true, InstallSnapshotPayload::Chunk(chunk)) => self.handle_snapshot_chunk(chunk).await?,
            (false, InstallSnapshotPayload::Notification(notification)) => {
                self.handle_snapshot_notification(req.term, notification)
            }
            _ => {
                tracing::warn!("InstallSnapshot payload shape does not match the configured install mode");
                InstallSnapshotResult::ConfMismatch
            }
        };

        self.update_next_election_timeout(true);
        Ok(InstallSnapshotResponse {
            term: self.state.current_term(),
            result: res,
        })
    }

    //////////////////////////////////////////////////////////////////////////////////////////////
    // Chunk mode /////////////////////////////////////////////////////////////////////////////////

    /// Durably install one chunk of a streamed snapshot.
    ///
    /// Chunks always arrive in order. A mismatched id with offset 0 begins a new stream
    /// replacing the old one; a mismatched id with a later offset is out of order and is
    /// rejected.
    #[tracing::instrument(level = "debug", skip(self, chunk))]
    async fn handle_snapshot_chunk(&mut self, chunk: SnapshotChunk) -> RaftResult<InstallSnapshotResult> {
        // The stream may only cover log the local snapshot does not.
        if self.state.latest_snapshot_id().index >= chunk.meta.last_log_id.index {
            return Ok(InstallSnapshotResult::AlreadyInstalled {
                snapshot_index: self.state.latest_snapshot_id().index,
            });
        }

        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(chunk).await,
            Some(SnapshotState::Snapshotting { handle, .. }) => {
                // Abort the local compaction in favor of the leader's snapshot.
                handle.abort();
                self.begin_installing_snapshot(chunk).await
            }
            Some(SnapshotState::Streaming { snapshot, id, offset }) => {
                if chunk.meta.snapshot_id == id {
                    return self.continue_installing_snapshot(chunk, offset, snapshot).await;
                }

                if chunk.offset == 0 {
                    return self.begin_installing_snapshot(chunk).await;
                }

                Err(RaftError::SnapshotMismatch {
                    expect: SnapshotSegmentId { id: id.clone(), offset },
                    got: SnapshotSegmentId {
                        id: chunk.meta.snapshot_id.clone(),
                        offset: chunk.offset,
                    },
                })
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, chunk))]
    async fn begin_installing_snapshot(&mut self, chunk: SnapshotChunk) -> RaftResult<InstallSnapshotResult> {
        let id = chunk.meta.snapshot_id.clone();

        if chunk.offset > 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: SnapshotSegmentId {
                    id: id.clone(),
                    offset: 0,
                },
                got: SnapshotSegmentId {
                    id,
                    offset: chunk.offset,
                },
            });
        }

        // Create a new snapshot and begin writing its contents.
        let mut snapshot =
            self.log.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&chunk.data).await?;

        // If this was a small snapshot, and it is already done, then finish up.
        if chunk.done {
            let chunk_index = chunk.chunk_index;
            self.finalize_streamed_snapshot(chunk, snapshot).await?;
            return Ok(InstallSnapshotResult::Success {
                chunk_index: chunk_index as i64,
            });
        }

        // Else, retain snapshot components for later segments & respond.
        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: chunk.data.len() as u64,
            id,
            snapshot,
        });
        Ok(InstallSnapshotResult::Success {
            chunk_index: chunk.chunk_index as i64,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, chunk, snapshot))]
    async fn continue_installing_snapshot(
        &mut self,
        chunk: SnapshotChunk,
        mut offset: u64,
        mut snapshot: Box<L::SnapshotData>,
    ) -> RaftResult<InstallSnapshotResult> {
        let id = chunk.meta.snapshot_id.clone();

        // Always seek to the target offset if not an exact match.
        if chunk.offset != offset {
            if let Err(err) = snapshot.as_mut().seek(SeekFrom::Start(chunk.offset)).await {
                self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
                return Err(err.into());
            }
            offset = chunk.offset;
        }

        // Write the next segment & update offset.
        if let Err(err) = snapshot.as_mut().write_all(&chunk.data).await {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Err(err.into());
        }
        offset += chunk.data.len() as u64;

        // If the snapshot stream is done, then finalize.
        let chunk_index = chunk.chunk_index;
        if chunk.done {
            self.finalize_streamed_snapshot(chunk, snapshot).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
        }
        Ok(InstallSnapshotResult::Success {
            chunk_index: chunk_index as i64,
        })
    }

    /// Finalize the installation of a fully streamed snapshot: hand it to storage, then
    /// pause and reload the state machine on top of it.
    ///
    /// Any errors which come up from this routine will cause the core to go into shutdown.
    #[tracing::instrument(level = "debug", skip(self, chunk, snapshot))]
    async fn finalize_streamed_snapshot(
        &mut self,
        chunk: SnapshotChunk,
        mut snapshot: Box<L::SnapshotData>,
    ) -> RaftResult<()> {
        snapshot.as_mut().shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;

        self.log
            .finalize_snapshot_installation(&chunk.meta, snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        if let Err(err) = self.state_machine.pause().await {
            return Err(self.map_fatal_storage_error(err));
        }
        if let Err(err) = self.state_machine.reload(chunk.meta.last_log_id).await {
            return Err(self.map_fatal_storage_error(err));
        }

        let membership = self.log.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_membership(membership, chunk.meta.last_log_id)?;

        let last_log_id = chunk.meta.last_log_id;
        self.state.last_log_id = self.state.last_log_id.max(last_log_id);
        self.state.last_applied = last_log_id;
        self.state.snapshot_last_log_id = last_log_id;
        self.last_enqueued_apply = self.last_enqueued_apply.max(last_log_id.index);
        if self.state.update_commit_index(last_log_id.index) {
            self.commit_infos.update(self.id, self.state.commit_index());
            if let Err(err) = self.log.save_commit_index(self.state.commit_index()).await {
                tracing::warn!(error=%err, "error persisting commit index after snapshot install");
            }
        }
        self.report_metrics(Update::Ignore);
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////////////////////////
    // Notify mode ////////////////////////////////////////////////////////////////////////////////

    /// Ask the state machine to obtain a snapshot itself, guarding against concurrent
    /// installs with the in-progress marker.
    #[tracing::instrument(level = "debug", skip(self))]
    fn handle_snapshot_notification(
        &mut self,
        leader_term: u64,
        notification: SnapshotNotification,
    ) -> InstallSnapshotResult {
        let first_available = notification.first_available;

        // Compare-and-set the in-progress marker; a concurrent install wins.
        if self.state.in_progress_snapshot.is_some() {
            return InstallSnapshotResult::InProgress;
        }
        self.state.in_progress_snapshot = Some(first_available);

        let snapshot_index = self.state.latest_snapshot_id().index;
        if snapshot_index + 1 >= first_available.index {
            self.state.in_progress_snapshot = None;
            return InstallSnapshotResult::AlreadyInstalled { snapshot_index };
        }

        // The install runs off the core task; whatever becomes of it, an event comes
        // back that settles or clears the marker. The timeout bounds a state machine
        // that never resolves.
        let sm = self.state_machine.clone();
        let tx_snapshot = self.tx_snapshot.clone();
        let install_cap = Duration::from_millis(self.config.snapshot_install_timeout);
        tokio::spawn(async move {
            let event = match timeout(install_cap, sm.notify_install_snapshot(first_available)).await {
                Ok(Ok(installed)) => SnapshotEvent::InstallSettled { installed, leader_term },
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "state machine failed a notified snapshot install");
                    SnapshotEvent::InstallFailed
                }
                Err(_) => {
                    tracing::warn!(
                        "state machine did not settle a notified snapshot install within {:?}",
                        install_cap
                    );
                    SnapshotEvent::InstallFailed
                }
            };
            let _ = tx_snapshot.send(event);
        });

        // The install is asynchronous; the reply only acknowledges that it started.
        InstallSnapshotResult::Success { chunk_index: -1 }
    }

    /// Complete a notified install: pause the state machine before swapping the snapshot
    /// in, then roll the log view forward and clear the in-progress marker.
    #[tracing::instrument(level = "debug", skip(self), fields(installed=%installed, leader_term))]
    pub(super) async fn finish_notified_install(&mut self, installed: LogId, leader_term: u64) -> RaftResult<()> {
        if let Err(err) = self.state_machine.pause().await {
            tracing::error!(error=%err, "error pausing state machine for snapshot reload");
            self.state.in_progress_snapshot = None;
            return Ok(());
        }
        if let Err(err) = self.state_machine.reload(installed).await {
            tracing::error!(error=%err, "error reloading state machine from installed snapshot");
            self.state.in_progress_snapshot = None;
            return Ok(());
        }

        // Entries covered by the snapshot are no longer needed locally.
        if let Err(err) = self.log.delete_logs_from(..=installed.index).await {
            tracing::warn!(error=%err, "error purging log below installed snapshot");
        }

        self.state.installed_snapshot = Some(installed);
        self.state.last_log_id = self.state.last_log_id.max(installed);
        if installed.index > self.state.last_applied.index {
            self.state.last_applied = installed;
        }
        self.last_enqueued_apply = self.last_enqueued_apply.max(installed.index);
        if self.state.update_commit_index(installed.index) {
            self.commit_infos.update(self.id, self.state.commit_index());
            if let Err(err) = self.log.save_commit_index(self.state.commit_index()).await {
                tracing::warn!(error=%err, "error persisting commit index after snapshot install");
            }
        }
        self.state.in_progress_snapshot = None;
        self.report_metrics(Update::Ignore);
        Ok(())
    }
}
