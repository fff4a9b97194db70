//! The per-peer persistent and volatile server state.

use anyhow::Result;

use crate::raft::MembershipConfig;
use crate::storage::PersistedMetadata;
use crate::AppData;
use crate::LogId;
use crate::NodeId;
use crate::RaftLog;

/// The state a server core maintains about itself: the persisted election metadata, the
/// log view, the snapshot pointers, the known leader and the configuration view.
///
/// All mutation happens on the core task; invariants (`current_term` and `commit_index`
/// never decrease, one vote per term) are enforced here rather than at the call sites.
pub(crate) struct ServerState {
    /// This node's ID.
    pub id: NodeId,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This is normally
    /// based on the leader's term which is communicated to other members via the
    /// AppendEntries protocol, but this may also be incremented when a follower becomes a
    /// candidate.
    current_term: u64,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,
    /// The ID of the current leader of the group, if known.
    current_leader: Option<NodeId>,

    /// The id of the last entry to be appended to the log.
    pub last_log_id: LogId,
    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Is initialized to 0, and increases monotonically. The commit index must be
    /// determined by a leader after successfully committing a new log to the cluster.
    commit_index: u64,
    /// The id of the highest log entry which has been applied to the local state machine.
    pub last_applied: LogId,

    /// The log id upto which the latest locally built snapshot includes, inclusive.
    pub snapshot_last_log_id: LogId,
    /// The log id of the latest snapshot installed at a leader's direction, if any.
    pub installed_snapshot: Option<LogId>,
    /// A snapshot install requested of the state machine and not yet settled.
    ///
    /// At most one may be outstanding; the compare-and-set discipline on this field is
    /// what makes concurrent install notifications reply `InProgress`.
    pub in_progress_snapshot: Option<LogId>,

    /// The group's current membership configuration.
    pub membership: MembershipConfig,
    /// The id of the log entry the membership config was read from; `(0, 0)` for an
    /// initial config that is not in the log.
    pub membership_log_id: LogId,
}

impl ServerState {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            last_log_id: LogId::default(),
            commit_index: 0,
            last_applied: LogId::default(),
            snapshot_last_log_id: LogId::default(),
            installed_snapshot: None,
            in_progress_snapshot: None,
            membership: MembershipConfig::new_initial(id),
            membership_log_id: LogId::default(),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.current_leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Adopt `new_term` if it is greater than the current term, resetting the recorded
    /// vote. Returns true iff the persisted metadata changed.
    pub fn update_current_term(&mut self, new_term: u64) -> bool {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }

    /// Record a vote for `candidate` in the current term.
    pub fn grant_vote(&mut self, candidate: NodeId) {
        self.voted_for = Some(candidate);
    }

    /// Assume a new candidate term: increment the term and vote for self.
    pub fn new_candidate_term(&mut self) {
        self.current_term += 1;
        self.voted_for = Some(self.id);
    }

    pub fn set_leader(&mut self, leader: Option<NodeId>) {
        self.current_leader = leader;
    }

    /// Whether `id` is acceptable as leader for `term`.
    ///
    /// Accept iff the term is current or newer, and a newer term, an unset leader or the
    /// same leader makes the claim unambiguous.
    pub fn recognize_leader(&self, id: NodeId, term: u64) -> bool {
        term >= self.current_term
            && (term > self.current_term || self.current_leader.is_none() || self.current_leader == Some(id))
    }

    /// Whether `candidate` may receive this peer's vote for `term`.
    ///
    /// Accept iff the term is current or newer, and a newer term, an unset vote or a
    /// repeated vote for the same candidate keeps votes unique per term.
    pub fn recognize_candidate(&self, candidate: NodeId, term: u64) -> bool {
        term >= self.current_term
            && (term > self.current_term || self.voted_for.is_none() || self.voted_for == Some(candidate))
    }

    /// The log up-to-date check of §5.4.1.
    pub fn is_log_up_to_date(&self, candidate_last: LogId) -> bool {
        candidate_last.term > self.last_log_id.term
            || (candidate_last.term == self.last_log_id.term && candidate_last.index >= self.last_log_id.index)
    }

    /// Advance the commit index, returning true if it moved. A lower value is ignored.
    pub fn update_commit_index(&mut self, new_commit: u64) -> bool {
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            true
        } else {
            false
        }
    }

    /// Whether the latest configuration entry is covered by the commit index.
    pub fn membership_committed(&self) -> bool {
        self.membership_log_id.index <= self.commit_index
    }

    /// Adopt a membership config observed at `log_id` (uncommitted until the commit index
    /// advances past it).
    pub fn update_membership(&mut self, membership: MembershipConfig, log_id: LogId) {
        self.membership = membership;
        self.membership_log_id = log_id;
    }

    /// The id of the snapshot the state machine currently stands on, favoring a
    /// leader-installed snapshot over a locally built one.
    pub fn latest_snapshot_id(&self) -> LogId {
        match self.installed_snapshot {
            Some(installed) if installed > self.snapshot_last_log_id => installed,
            _ => self.snapshot_last_log_id,
        }
    }

    pub fn metadata(&self) -> PersistedMetadata {
        PersistedMetadata {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    /// Restore term and vote from persisted metadata at startup.
    pub fn load_metadata(&mut self, md: PersistedMetadata) {
        self.current_term = md.current_term;
        self.voted_for = md.voted_for;
    }

    /// Durably flush the election metadata through the log storage.
    ///
    /// Must complete before any RPC that reveals the new term or vote is sent.
    pub async fn persist_metadata<D: AppData, L: RaftLog<D>>(&self, log: &L) -> Result<()> {
        log.save_metadata(&self.metadata()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ServerState {
        ServerState::new(0)
    }

    #[test]
    fn test_term_never_decreases() {
        let mut s = state();
        assert!(s.update_current_term(3));
        assert!(!s.update_current_term(2));
        assert!(!s.update_current_term(3));
        assert_eq!(3, s.current_term());
        assert!(s.update_current_term(4));
    }

    #[test]
    fn test_term_bump_resets_vote() {
        let mut s = state();
        s.update_current_term(1);
        s.grant_vote(2);
        assert_eq!(Some(2), s.voted_for());
        s.update_current_term(2);
        assert_eq!(None, s.voted_for());
    }

    #[test]
    fn test_vote_unique_within_term() {
        let mut s = state();
        s.update_current_term(5);
        assert!(s.recognize_candidate(1, 5));
        s.grant_vote(1);
        // Same term: only the same candidate is recognized again.
        assert!(s.recognize_candidate(1, 5));
        assert!(!s.recognize_candidate(2, 5));
        // A newer term reopens the vote.
        assert!(s.recognize_candidate(2, 6));
    }

    #[test]
    fn test_recognize_leader() {
        let mut s = state();
        s.update_current_term(2);
        assert!(s.recognize_leader(1, 2));
        s.set_leader(Some(1));
        assert!(s.recognize_leader(1, 2));
        assert!(!s.recognize_leader(2, 2));
        assert!(s.recognize_leader(2, 3));
        assert!(!s.recognize_leader(1, 1));
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut s = state();
        s.last_log_id = LogId::new(2, 10);
        assert!(s.is_log_up_to_date(LogId::new(3, 1)));
        assert!(s.is_log_up_to_date(LogId::new(2, 10)));
        assert!(s.is_log_up_to_date(LogId::new(2, 11)));
        assert!(!s.is_log_up_to_date(LogId::new(2, 9)));
        assert!(!s.is_log_up_to_date(LogId::new(1, 100)));
    }

    #[test]
    fn test_commit_index_monotonic() {
        let mut s = state();
        assert!(s.update_commit_index(5));
        assert!(!s.update_commit_index(4));
        assert!(!s.update_commit_index(5));
        assert_eq!(5, s.commit_index());
    }

    #[test]
    fn test_membership_committed_tracks_commit_index() {
        let mut s = state();
        s.update_membership(MembershipConfig::new_initial(0), LogId::new(1, 4));
        assert!(!s.membership_committed());
        s.update_commit_index(4);
        assert!(s.membership_committed());
    }

    #[test]
    fn test_latest_snapshot_prefers_newer_install() {
        let mut s = state();
        s.snapshot_last_log_id = LogId::new(1, 100);
        assert_eq!(LogId::new(1, 100), s.latest_snapshot_id());
        s.installed_snapshot = Some(LogId::new(2, 50));
        assert_eq!(LogId::new(2, 50), s.latest_snapshot_id());
        s.snapshot_last_log_id = LogId::new(2, 80);
        assert_eq!(LogId::new(2, 80), s.latest_snapshot_id());
    }
}
