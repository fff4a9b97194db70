//! Per-peer commit index bookkeeping.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// The highest log index a given peer is known to have committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub peer: NodeId,
    pub commit_index: u64,
}

/// A cache of the last known committed index of every peer of the group.
///
/// Indices only ever advance; updates carrying an older value are ignored.
#[derive(Debug, Default)]
pub(crate) struct CommitInfoCache {
    peers: BTreeMap<NodeId, u64>,
}

impl CommitInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the given peer's committed index, returning true if the cache advanced.
    pub fn update(&mut self, peer: NodeId, commit_index: u64) -> bool {
        let slot = self.peers.entry(peer).or_insert(0);
        if commit_index > *slot {
            *slot = commit_index;
            true
        } else {
            false
        }
    }

    /// Fold a batch of commit infos received from a peer into the cache.
    pub fn fold(&mut self, infos: &[CommitInfo]) {
        for info in infos {
            self.update(info.peer, info.commit_index);
        }
    }

    pub fn get(&self, peer: NodeId) -> u64 {
        self.peers.get(&peer).copied().unwrap_or(0)
    }

    /// A snapshot of all known commit infos, for replies and group info.
    pub fn to_vec(&self) -> Vec<CommitInfo> {
        self.peers
            .iter()
            .map(|(peer, commit_index)| CommitInfo {
                peer: *peer,
                commit_index: *commit_index,
            })
            .collect()
    }

    /// Whether every one of `peers` is known to have committed at least `index`.
    pub fn all_committed(&self, peers: impl IntoIterator<Item = NodeId>, index: u64) -> bool {
        peers.into_iter().all(|p| self.get(p) >= index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_index_is_monotonic() {
        let mut cache = CommitInfoCache::new();
        assert!(cache.update(1, 5));
        assert!(!cache.update(1, 3));
        assert!(!cache.update(1, 5));
        assert_eq!(5, cache.get(1));
        assert!(cache.update(1, 6));
        assert_eq!(6, cache.get(1));
    }

    #[test]
    fn test_fold_and_snapshot() {
        let mut cache = CommitInfoCache::new();
        cache.fold(&[
            CommitInfo { peer: 1, commit_index: 4 },
            CommitInfo { peer: 2, commit_index: 9 },
            CommitInfo { peer: 1, commit_index: 2 },
        ]);
        assert_eq!(4, cache.get(1));
        assert_eq!(9, cache.get(2));
        assert_eq!(2, cache.to_vec().len());
    }

    #[test]
    fn test_all_committed() {
        let mut cache = CommitInfoCache::new();
        cache.update(1, 10);
        cache.update(2, 8);
        assert!(cache.all_committed(vec![1, 2], 8));
        assert!(!cache.all_committed(vec![1, 2], 9));
        assert!(!cache.all_committed(vec![1, 2, 3], 1));
    }
}
