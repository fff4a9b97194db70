//! The user supplied state machine interface.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::core::Role;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::ClientId;
use crate::GroupId;
use crate::LogId;

/// A client transaction staged by the state machine, threaded from submission through the
/// log to the apply loop.
///
/// The context is created on the leader by `start_transaction` and handed back to
/// `apply_transaction` once the entry commits; a follower (or a restarted leader)
/// synthesizes an equivalent context from the log entry instead.
#[derive(Debug, Clone)]
pub struct TransactionContext<D: AppData> {
    /// The submitting client.
    pub client_id: ClientId,
    /// The client-chosen serial of this call.
    pub call_id: CallId,
    /// The id assigned when the transaction was appended to the log; `(0, 0)` until then.
    pub log_id: LogId,
    /// The transaction payload, possibly transformed by `start_transaction`.
    pub data: D,
}

impl<D: AppData> TransactionContext<D> {
    pub fn new(client_id: ClientId, call_id: CallId, data: D) -> Self {
        Self {
            client_id,
            call_id,
            log_id: LogId::default(),
            data,
        }
    }
}

/// A trait defining the interface of the application state machine attached to a peer.
///
/// The apply loop invokes this trait single-threadedly and strictly in log-index order;
/// implementations do not need to defend against concurrent applies.
#[async_trait]
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Validate and stage a client write, producing the transaction context which will be
    /// appended to the log.
    ///
    /// An error fails the client's retry cache entry and is returned in its reply; no log
    /// entry is created.
    async fn start_transaction(&self, client_id: &ClientId, call_id: CallId, data: D) -> Result<TransactionContext<D>>;

    /// A hook invoked immediately before the staged transaction is appended to the
    /// leader's log.
    ///
    /// An error here additionally fences the leader into stepping down, since a state
    /// machine that refuses pre-append may hold inconsistent state.
    async fn pre_append_transaction(&self, ctx: TransactionContext<D>) -> Result<TransactionContext<D>> {
        Ok(ctx)
    }

    /// Apply the side effects of a committed transaction which must run strictly in log
    /// order, ahead of the (potentially slower) `apply_transaction`.
    async fn apply_transaction_serial(&self, _ctx: &TransactionContext<D>) -> Result<()> {
        Ok(())
    }

    /// Apply a committed transaction, returning the response which is cached for the
    /// client and replayed on duplicate submissions.
    async fn apply_transaction(&self, ctx: TransactionContext<D>) -> Result<R>;

    /// Serve a query against the latest applied state. Only invoked on a ready leader.
    async fn query(&self, request: Bytes) -> Result<R>;

    /// Serve a query tolerating staleness; the core has already verified that the local
    /// commit index covers the client's `min_index`.
    async fn query_stale(&self, request: Bytes, min_index: u64) -> Result<R>;

    /// Observe a committed log index which carried no transaction data (a blank no-op or
    /// other metadata entry).
    async fn notify_index_update(&self, _term: u64, _index: u64) -> Result<()> {
        Ok(())
    }

    /// The leader can no longer replicate entries below `first_available`; the state
    /// machine must obtain and stage a snapshot covering at least the preceding log.
    ///
    /// Returns the log id covered by the obtained snapshot. The core pauses and reloads
    /// the state machine around the snapshot once this resolves.
    async fn notify_install_snapshot(&self, first_available: LogId) -> Result<LogId>;

    /// There has been no leader contact for an extended period while in the given role.
    async fn notify_no_leader(&self, _group_id: &GroupId, _role: Role) {}

    /// Pause the state machine: once this resolves, no further applies are observed until
    /// `reload` completes.
    async fn pause(&self) -> Result<()>;

    /// Reload the state machine from the snapshot covering `log_id`, then resume.
    async fn reload(&self, log_id: LogId) -> Result<()>;

    /// The log id covered by the latest state machine snapshot, if one exists.
    async fn latest_snapshot(&self) -> Result<Option<LogId>>;
}
