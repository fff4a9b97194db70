//! An in-memory implementation of the raft-core `RaftLog` and `StateMachine` traits.
//!
//! `MemStore` backs the integration test harness: it keeps the replicated log, the
//! persisted election metadata and a small key/value state machine in memory, all behind
//! one value which is handed to the core both as its log storage and as its state
//! machine.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::Bound;
use std::ops::RangeBounds;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use raft_core::raft::Entry;
use raft_core::raft::EntryPayload;
use raft_core::raft::MembershipConfig;
use raft_core::state_machine::TransactionContext;
use raft_core::storage::InitialState;
use raft_core::storage::PersistedMetadata;
use raft_core::storage::Snapshot;
use raft_core::storage::SnapshotMeta;
use raft_core::CallId;
use raft_core::ClientId;
use raft_core::LogId;
use raft_core::NodeId;
use raft_core::RaftLog;
use raft_core::RaftLogDebug;
use raft_core::StateMachine;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// A request to set a key to a value in the replicated store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub key: String,
    pub value: String,
}

/// The value of the key before the request was applied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse(pub Option<String>);

/// The set of errors the in-memory store may surface to the core.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("the state machine is paused for a snapshot reload")]
    Paused,
    #[error("no snapshot is obtainable covering the log up to {0}")]
    NoObtainableSnapshot(u64),
}

/// The key/value state machine of a `MemStore`.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MemStateMachine {
    pub kv: BTreeMap<String, String>,
    /// The id of the last entry applied, metadata entries included.
    pub last_applied_log: LogId,
    /// How many times each (client, call) was actually applied; at-most-once semantics
    /// require every value here to stay at 1.
    pub applied_calls: BTreeMap<(ClientId, CallId), u64>,
}

/// A snapshot the state machine can obtain when the leader notifies that log entries
/// below some index are no longer replicable.
#[derive(Debug, Clone)]
pub struct ObtainableSnapshot {
    pub log_id: LogId,
    pub kv: BTreeMap<String, String>,
}

struct MemStoreSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

/// An in-memory log store + state machine.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<u64, Entry<StoreRequest>>>,
    metadata: RwLock<Option<PersistedMetadata>>,
    commit_index: RwLock<u64>,
    sm: RwLock<MemStateMachine>,
    paused: RwLock<bool>,
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
    /// The snapshot source a notified install draws from, seeded by tests to stand in
    /// for whatever out-of-band channel a real deployment uses.
    obtainable_snapshot: RwLock<Option<ObtainableSnapshot>>,
    /// An obtained snapshot staged for the reload that follows the install.
    staged_install: RwLock<Option<ObtainableSnapshot>>,
    sm_snapshot: RwLock<Option<LogId>>,
    notify_install_count: std::sync::atomic::AtomicU64,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            metadata: RwLock::new(None),
            commit_index: RwLock::new(0),
            sm: RwLock::new(MemStateMachine::default()),
            paused: RwLock::new(false),
            current_snapshot: RwLock::new(None),
            obtainable_snapshot: RwLock::new(None),
            staged_install: RwLock::new(None),
            sm_snapshot: RwLock::new(None),
            notify_install_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> BTreeMap<u64, Entry<StoreRequest>> {
        self.log.read().await.clone()
    }

    /// Get a copy of the state machine for testing purposes.
    pub async fn get_state_machine(&self) -> MemStateMachine {
        self.sm.read().await.clone()
    }

    /// How many times the given call was applied to the state machine.
    pub async fn apply_count(&self, client_id: &str, call_id: CallId) -> u64 {
        self.sm.read().await.applied_calls.get(&(client_id.to_string(), call_id)).copied().unwrap_or(0)
    }

    /// Seed the snapshot a notified install will obtain.
    pub async fn set_obtainable_snapshot(&self, log_id: LogId, kv: BTreeMap<String, String>) {
        *self.obtainable_snapshot.write().await = Some(ObtainableSnapshot { log_id, kv });
    }

    /// How many times the state machine was asked to obtain a snapshot.
    pub fn notify_install_count(&self) -> u64 {
        self.notify_install_count.load(std::sync::atomic::Ordering::Acquire)
    }

    /// The id and contents of the currently held snapshot, for seeding other stores in
    /// tests.
    pub async fn current_snapshot_contents(&self) -> Option<(LogId, BTreeMap<String, String>)> {
        let snapshot = self.current_snapshot.read().await;
        let snapshot = snapshot.as_ref()?;
        let kv = serde_json::from_slice(&snapshot.data).ok()?;
        Some((snapshot.meta.last_log_id, kv))
    }

    async fn membership_from_log(&self) -> MembershipConfig {
        let log = self.log.read().await;
        let from_log = log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(conf) => Some(conf.membership.clone()),
            _ => None,
        });
        if let Some(membership) = from_log {
            return membership;
        }
        if let Some(snapshot) = self.current_snapshot.read().await.as_ref() {
            return snapshot.meta.membership.clone();
        }
        MembershipConfig::new_initial(self.id)
    }
}

#[async_trait]
impl RaftLog<StoreRequest> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        Ok(self.membership_from_log().await)
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let metadata = self.metadata.read().await.clone();
        let log = self.log.read().await;
        match metadata {
            Some(metadata) => {
                let last_log_id = match log.values().next_back() {
                    Some(entry) => entry.log_id,
                    None => self
                        .current_snapshot
                        .read()
                        .await
                        .as_ref()
                        .map(|snap| snap.meta.last_log_id)
                        .unwrap_or_default(),
                };
                drop(log);
                Ok(InitialState {
                    last_log_id,
                    last_applied_log: self.sm.read().await.last_applied_log,
                    metadata,
                    membership: self.membership_from_log().await,
                })
            }
            None => Ok(InitialState::new_initial(self.id)),
        }
    }

    async fn save_metadata(&self, md: &PersistedMetadata) -> Result<()> {
        *self.metadata.write().await = Some(md.clone());
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<StoreRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<StoreRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    async fn contains(&self, log_id: LogId) -> Result<bool> {
        let log = self.log.read().await;
        Ok(log.get(&log_id.index).map(|entry| entry.log_id == log_id).unwrap_or(false))
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        match log.values().next_back() {
            Some(entry) => Ok(entry.log_id),
            None => Ok(self.sm.read().await.last_applied_log),
        }
    }

    async fn get_next_index(&self) -> Result<u64> {
        Ok(self.get_last_log_id().await?.index + 1)
    }

    async fn get_last_committed_index(&self) -> Result<u64> {
        Ok(*self.commit_index.read().await)
    }

    async fn save_commit_index(&self, commit_index: u64) -> Result<()> {
        let mut guard = self.commit_index.write().await;
        if commit_index > *guard {
            *guard = commit_index;
        }
        Ok(())
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(key, _)| *key).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn append(&self, entries: &[&Entry<StoreRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (kv, last_applied_log);
        {
            let sm = self.sm.read().await;
            kv = sm.kv.clone();
            last_applied_log = sm.last_applied_log;
        }
        if last_applied_log.index == 0 {
            return Err(anyhow!("nothing applied yet, no snapshot to build"));
        }

        let membership = self.membership_from_log().await;
        let data = serde_json::to_vec(&kv)?;
        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            membership,
            snapshot_id: format!("{}-{}", last_applied_log.term, last_applied_log.index),
        };

        {
            // Logs covered by the snapshot are replaced by a purged marker.
            let mut log = self.log.write().await;
            let keys: Vec<u64> = log.range((Bound::Unbounded, Bound::Included(last_applied_log.index))).map(|(key, _)| *key).collect();
            for key in keys {
                log.remove(&key);
            }
            log.insert(last_applied_log.index, Entry::new_purged_marker(last_applied_log));
        }

        *self.current_snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });
        *self.sm_snapshot.write().await = Some(last_applied_log);

        tracing::trace!({ snapshot_size = data.len() }, "log compaction complete");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        let data = snapshot.into_inner();
        let kv: BTreeMap<String, String> = serde_json::from_slice(&data)?;

        {
            let mut log = self.log.write().await;
            let keys: Vec<u64> =
                log.range((Bound::Unbounded, Bound::Included(meta.last_log_id.index))).map(|(key, _)| *key).collect();
            for key in keys {
                log.remove(&key);
            }
            log.insert(meta.last_log_id.index, Entry::new_purged_marker(meta.last_log_id));
        }

        // Stage the contents for the reload that follows.
        *self.staged_install.write().await = Some(ObtainableSnapshot {
            log_id: meta.last_log_id,
            kv,
        });
        *self.current_snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(Snapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateMachine<StoreRequest, StoreResponse> for MemStore {
    async fn start_transaction(
        &self,
        client_id: &ClientId,
        call_id: CallId,
        data: StoreRequest,
    ) -> Result<TransactionContext<StoreRequest>> {
        Ok(TransactionContext::new(client_id.clone(), call_id, data))
    }

    async fn apply_transaction(&self, ctx: TransactionContext<StoreRequest>) -> Result<StoreResponse> {
        if *self.paused.read().await {
            return Err(StoreError::Paused.into());
        }
        let mut sm = self.sm.write().await;
        let previous = sm.kv.insert(ctx.data.key, ctx.data.value);
        *sm.applied_calls.entry((ctx.client_id, ctx.call_id)).or_insert(0) += 1;
        sm.last_applied_log = ctx.log_id;
        Ok(StoreResponse(previous))
    }

    async fn query(&self, request: Bytes) -> Result<StoreResponse> {
        let key = String::from_utf8(request.to_vec())?;
        let sm = self.sm.read().await;
        Ok(StoreResponse(sm.kv.get(&key).cloned()))
    }

    async fn query_stale(&self, request: Bytes, _min_index: u64) -> Result<StoreResponse> {
        self.query(request).await
    }

    async fn notify_index_update(&self, term: u64, index: u64) -> Result<()> {
        let mut sm = self.sm.write().await;
        if index > sm.last_applied_log.index {
            sm.last_applied_log = LogId { term, index };
        }
        Ok(())
    }

    async fn notify_install_snapshot(&self, first_available: LogId) -> Result<LogId> {
        self.notify_install_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        let obtainable = self.obtainable_snapshot.read().await.clone();
        match obtainable {
            Some(snapshot) if snapshot.log_id.index + 1 >= first_available.index => {
                let log_id = snapshot.log_id;
                *self.staged_install.write().await = Some(snapshot);
                Ok(log_id)
            }
            _ => Err(StoreError::NoObtainableSnapshot(first_available.index).into()),
        }
    }

    async fn pause(&self) -> Result<()> {
        *self.paused.write().await = true;
        Ok(())
    }

    async fn reload(&self, log_id: LogId) -> Result<()> {
        let staged = self.staged_install.write().await.take();
        match staged {
            Some(staged) => {
                let mut sm = self.sm.write().await;
                sm.kv = staged.kv;
                sm.last_applied_log = staged.log_id;
            }
            None => {
                // Reload from the locally held snapshot if it covers the requested id.
                let current = self.current_snapshot.read().await;
                match current.as_ref() {
                    Some(snapshot) if snapshot.meta.last_log_id == log_id => {
                        let kv: BTreeMap<String, String> = serde_json::from_slice(&snapshot.data)?;
                        let mut sm = self.sm.write().await;
                        sm.kv = kv;
                        sm.last_applied_log = log_id;
                    }
                    _ => return Err(anyhow!("no snapshot staged or held covering {}", log_id)),
                }
            }
        }
        *self.sm_snapshot.write().await = Some(log_id);
        *self.paused.write().await = false;
        Ok(())
    }

    async fn latest_snapshot(&self) -> Result<Option<LogId>> {
        Ok(*self.sm_snapshot.read().await)
    }
}

#[async_trait]
impl RaftLogDebug for MemStore {
    async fn read_metadata(&self) -> Option<PersistedMetadata> {
        self.metadata.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64, key: &str, value: &str) -> Entry<StoreRequest> {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Normal(raft_core::raft::StateMachineEntry {
                client_id: "c0".into(),
                call_id: index,
                data: StoreRequest {
                    key: key.into(),
                    value: value.into(),
                },
            }),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = MemStore::new(0);
        let entries = vec![entry(1, 1, "a", "1"), entry(1, 2, "b", "2")];
        let refs: Vec<&Entry<StoreRequest>> = entries.iter().collect();
        store.append(&refs).await.unwrap();

        assert_eq!(LogId { term: 1, index: 2 }, store.get_last_log_id().await.unwrap());
        assert!(store.contains(LogId { term: 1, index: 1 }).await.unwrap());
        assert!(!store.contains(LogId { term: 2, index: 1 }).await.unwrap());
        assert_eq!(2, store.get_log_entries(..).await.unwrap().len());
    }

    #[tokio::test]
    async fn test_apply_tracks_calls() {
        let store = MemStore::new(0);
        let mut ctx = TransactionContext::new(
            "c0".into(),
            7,
            StoreRequest {
                key: "k".into(),
                value: "1".into(),
            },
        );
        ctx.log_id = LogId { term: 1, index: 1 };
        let res = store.apply_transaction(ctx).await.unwrap();
        assert_eq!(StoreResponse(None), res);
        assert_eq!(1, store.apply_count("c0", 7).await);

        let sm = store.get_state_machine().await;
        assert_eq!(Some(&"1".to_string()), sm.kv.get("k"));
        assert_eq!(LogId { term: 1, index: 1 }, sm.last_applied_log);
    }

    #[tokio::test]
    async fn test_notified_install_stages_and_reloads() {
        let store = MemStore::new(1);
        let mut kv = BTreeMap::new();
        kv.insert("k".to_string(), "999".to_string());
        store.set_obtainable_snapshot(LogId { term: 2, index: 1000 }, kv).await;

        let installed =
            store.notify_install_snapshot(LogId { term: 2, index: 1001 }).await.unwrap();
        assert_eq!(LogId { term: 2, index: 1000 }, installed);

        store.pause().await.unwrap();
        store.reload(installed).await.unwrap();
        let sm = store.get_state_machine().await;
        assert_eq!(Some(&"999".to_string()), sm.kv.get("k"));
        assert_eq!(installed, sm.last_applied_log);
        assert_eq!(Some(installed), store.latest_snapshot().await.unwrap());
    }

    #[tokio::test]
    async fn test_notified_install_requires_coverage() {
        let store = MemStore::new(1);
        let res = store.notify_install_snapshot(LogId { term: 2, index: 1001 }).await;
        assert!(res.is_err());
    }
}
