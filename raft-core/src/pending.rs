//! Leader-side bookkeeping for client writes awaiting commit and apply.

use std::collections::BTreeMap;

use crate::retry_cache::CacheKey;
use crate::state_machine::TransactionContext;
use crate::AppData;

/// One client write awaiting commit and apply, keyed by its log index.
///
/// The client's response channel lives in the retry cache entry for its key; this record
/// carries the staged transaction context so that the apply loop can reuse it instead of
/// synthesizing one from the log entry.
pub(crate) struct PendingRequest<D: AppData> {
    pub key: CacheKey,
    pub ctx: Option<TransactionContext<D>>,
}

/// The map of client writes this leader originated which have not yet been applied.
///
/// Entries are created on append, drained by the apply loop as their indices commit, and
/// failed wholesale when leadership is lost.
#[derive(Default)]
pub(crate) struct PendingRequests<D: AppData> {
    requests: BTreeMap<u64, PendingRequest<D>>,
}

impl<D: AppData> PendingRequests<D> {
    pub fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
        }
    }

    pub fn enqueue(&mut self, index: u64, key: CacheKey, ctx: TransactionContext<D>) {
        self.requests.insert(index, PendingRequest { key, ctx: Some(ctx) });
    }

    /// Take the staged transaction context for `index`, if this peer originated it.
    pub fn take_ctx(&mut self, index: u64) -> Option<TransactionContext<D>> {
        self.requests.get_mut(&index).and_then(|req| req.ctx.take())
    }

    /// Resolve the request at `index`, returning its retry cache key.
    pub fn resolve(&mut self, index: u64) -> Option<CacheKey> {
        self.requests.remove(&index).map(|req| req.key)
    }

    /// Drain every outstanding request, for failing them on leadership loss or shutdown.
    pub fn drain(&mut self) -> Vec<(u64, CacheKey)> {
        std::mem::take(&mut self.requests)
            .into_iter()
            .map(|(index, req)| (index, req.key))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_take_resolve() {
        let mut pending: PendingRequests<u64> = PendingRequests::new();
        let ctx = TransactionContext::new("c0".into(), 3, 17);
        pending.enqueue(5, ("c0".into(), 3), ctx);
        assert_eq!(1, pending.len());

        let ctx = pending.take_ctx(5).unwrap();
        assert_eq!(17, ctx.data);
        assert!(pending.take_ctx(5).is_none());

        let key = pending.resolve(5).unwrap();
        assert_eq!(("c0".to_string(), 3), key);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain_returns_all_keys_in_index_order() {
        let mut pending: PendingRequests<u64> = PendingRequests::new();
        pending.enqueue(9, ("c0".into(), 2), TransactionContext::new("c0".into(), 2, 0));
        pending.enqueue(4, ("c1".into(), 1), TransactionContext::new("c1".into(), 1, 0));

        let drained = pending.drain();
        assert_eq!(vec![4, 9], drained.iter().map(|(idx, _)| *idx).collect::<Vec<_>>());
        assert!(pending.is_empty());
    }
}
