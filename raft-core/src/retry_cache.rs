//! The at-most-once client retry cache.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::raft::ClientReply;
use crate::raft::ClientResponseTx;
use crate::AppDataResponse;
use crate::CallId;
use crate::ClientId;

/// The key of a retry cache entry.
pub type CacheKey = (ClientId, CallId);

/// The observable state of a retry cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    CompletedOk,
    CompletedFail,
}

/// The outcome of admitting a write submission.
pub(crate) enum Admission<R: AppDataResponse> {
    /// No usable prior attempt exists; the caller owns this attempt and must complete it.
    New,
    /// A prior attempt is still in flight; the submission was attached to its entry and
    /// will be answered when it completes.
    AttachedPending,
    /// A prior attempt completed successfully; the cached reply is replayed as-is.
    Replay(Arc<ClientReply<R>>),
}

enum EntryState<R: AppDataResponse> {
    Pending { waiters: Vec<ClientResponseTx<R>> },
    Completed { reply: Arc<ClientReply<R>> },
}

struct CacheEntry<R: AppDataResponse> {
    state: EntryState<R>,
    expires_at: Instant,
}

/// A bounded table suppressing duplicate client submissions, keyed by
/// `(client_id, call_id)`.
///
/// Any two submissions with the same key that both complete yield the same reply: the
/// first attempt executes, later ones either attach to the pending attempt or replay the
/// cached reply. A completed failure does not suppress a fresh attempt. Entries are
/// reaped on expiry and under LRU pressure.
pub(crate) struct RetryCache<R: AppDataResponse> {
    entries: LruCache<CacheKey, CacheEntry<R>>,
    expiry: Duration,
}

impl<R: AppDataResponse> RetryCache<R> {
    pub fn new(capacity: usize, expiry: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: LruCache::new(capacity),
            expiry,
        }
    }

    /// Admit a write submission, registering `tx` to be answered by this attempt.
    ///
    /// A completed-OK prior attempt is replayed to `tx` immediately, without re-entering
    /// the state machine.
    pub fn admit(&mut self, key: CacheKey, tx: ClientResponseTx<R>) -> Admission<R> {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.expires_at > Instant::now() {
                match &mut entry.state {
                    EntryState::Pending { waiters } => {
                        waiters.push(tx);
                        return Admission::AttachedPending;
                    }
                    EntryState::Completed { reply } => {
                        if reply.success {
                            let reply = reply.clone();
                            let _ = tx.send(Ok(reply.clone()));
                            return Admission::Replay(reply);
                        }
                        // A failed attempt does not block a retry; fall through and
                        // reserve the slot anew.
                    }
                }
            }
        }

        self.entries.put(key, CacheEntry {
            state: EntryState::Pending { waiters: vec![tx] },
            expires_at: Instant::now() + self.expiry,
        });
        Admission::New
    }

    /// Complete the entry at `key`, answering every attached waiter with the reply.
    ///
    /// Completion is idempotent: completing an already-completed or absent entry (e.g.
    /// one evicted under pressure) is a no-op beyond re-recording the reply.
    pub fn complete(&mut self, key: CacheKey, reply: Arc<ClientReply<R>>) {
        let waiters = match self.entries.get_mut(&key) {
            Some(entry) => {
                let prior = std::mem::replace(&mut entry.state, EntryState::Completed { reply: reply.clone() });
                entry.expires_at = Instant::now() + self.expiry;
                match prior {
                    EntryState::Pending { waiters } => waiters,
                    EntryState::Completed { reply: prior_reply } => {
                        // Keep the first completion; at-most-once means later results
                        // must not replace an observable reply.
                        entry.state = EntryState::Completed { reply: prior_reply };
                        Vec::new()
                    }
                }
            }
            None => {
                self.entries.put(key, CacheEntry {
                    state: EntryState::Completed { reply: reply.clone() },
                    expires_at: Instant::now() + self.expiry,
                });
                Vec::new()
            }
        };
        for tx in waiters {
            let _ = tx.send(Ok(reply.clone()));
        }
    }

    /// The cached reply for `key` if its attempt completed successfully.
    pub fn completed_ok(&mut self, key: &CacheKey) -> Option<Arc<ClientReply<R>>> {
        match self.entries.get(key) {
            Some(CacheEntry {
                state: EntryState::Completed { reply },
                expires_at,
            }) if *expires_at > Instant::now() && reply.success => Some(reply.clone()),
            _ => None,
        }
    }

    /// The observable state of the entry at `key`.
    pub fn state(&mut self, key: &CacheKey) -> Option<RetryState> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(match &entry.state {
                EntryState::Pending { .. } => RetryState::Pending,
                EntryState::Completed { reply } if reply.success => RetryState::CompletedOk,
                EntryState::Completed { .. } => RetryState::CompletedFail,
            }),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn reply(ok: bool) -> Arc<ClientReply<u64>> {
        let reply = if ok {
            ClientReply::success("c0".into(), 1, 7, Some(42), vec![])
        } else {
            ClientReply::failure(
                "c0".into(),
                1,
                0,
                crate::error::ClientException::StateMachineFailure {
                    message: "boom".into(),
                },
                vec![],
            )
        };
        Arc::new(reply)
    }

    fn cache() -> RetryCache<u64> {
        RetryCache::new(8, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_completed_ok_replays_same_reply() {
        let mut cache = cache();
        let key: CacheKey = ("c0".into(), 1);

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(cache.admit(key.clone(), tx), Admission::New));

        let first = reply(true);
        cache.complete(key.clone(), first.clone());
        assert_eq!(Some(RetryState::CompletedOk), cache.state(&key));

        let (tx, rx) = oneshot::channel();
        match cache.admit(key.clone(), tx) {
            Admission::Replay(replayed) => assert!(Arc::ptr_eq(&first, &replayed)),
            _ => panic!("expected replay of the cached reply"),
        }
        let got = rx.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &got));
    }

    #[tokio::test]
    async fn test_pending_attaches_waiters() {
        let mut cache = cache();
        let key: CacheKey = ("c0".into(), 1);

        let (tx0, _rx0) = oneshot::channel();
        assert!(matches!(cache.admit(key.clone(), tx0), Admission::New));

        let (tx1, rx1) = oneshot::channel();
        assert!(matches!(cache.admit(key.clone(), tx1), Admission::AttachedPending));

        cache.complete(key, reply(true));
        let got = rx1.await.unwrap().unwrap();
        assert!(got.success);
        assert_eq!(Some(42), got.result);
    }

    #[tokio::test]
    async fn test_completed_fail_allows_retry() {
        let mut cache = cache();
        let key: CacheKey = ("c0".into(), 1);

        let (tx, _rx) = oneshot::channel();
        cache.admit(key.clone(), tx);
        cache.complete(key.clone(), reply(false));
        assert_eq!(Some(RetryState::CompletedFail), cache.state(&key));

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(cache.admit(key.clone(), tx), Admission::New));
        assert_eq!(Some(RetryState::Pending), cache.state(&key));
    }

    #[tokio::test]
    async fn test_expired_entry_is_reaped() {
        let mut cache = RetryCache::new(8, Duration::from_millis(10));
        let key: CacheKey = ("c0".into(), 1);

        let (tx, _rx) = oneshot::channel();
        cache.admit(key.clone(), tx);
        cache.complete(key.clone(), reply(true));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(None, cache.state(&key));
        let (tx, _rx) = oneshot::channel();
        assert!(matches!(cache.admit(key, tx), Admission::New));
    }

    #[tokio::test]
    async fn test_lru_pressure_evicts_oldest() {
        let mut cache: RetryCache<u64> = RetryCache::new(2, Duration::from_secs(60));
        for call in 0..3u64 {
            let (tx, _rx) = oneshot::channel();
            cache.admit(("c0".into(), call), tx);
        }
        assert_eq!(2, cache.len());
        assert_eq!(None, cache.state(&("c0".into(), 0)));
        assert_eq!(Some(RetryState::Pending), cache.state(&("c0".into(), 2)));
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let mut cache = cache();
        let key: CacheKey = ("c0".into(), 1);

        let (tx, _rx) = oneshot::channel();
        cache.admit(key.clone(), tx);
        let first = reply(true);
        cache.complete(key.clone(), first.clone());
        cache.complete(key.clone(), reply(false));

        match cache.completed_ok(&key) {
            Some(got) => assert!(Arc::ptr_eq(&first, &got)),
            None => panic!("expected the first completion to remain cached"),
        }
    }
}
