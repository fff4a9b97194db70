//! The server core's lifecycle gate.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftError;
use crate::error::RaftResult;

/// The lifecycle states of a server core.
///
/// Legal transitions are `New -> Starting -> Running -> Closing -> Closed`, plus
/// `New -> Closed` for a core which is dropped without ever being started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LifeCycleState {
    New = 0,
    Starting = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl LifeCycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifeCycleState::New,
            1 => LifeCycleState::Starting,
            2 => LifeCycleState::Running,
            3 => LifeCycleState::Closing,
            _ => LifeCycleState::Closed,
        }
    }

    fn may_transition_to(self, to: LifeCycleState) -> bool {
        use LifeCycleState::*;
        matches!(
            (self, to),
            (New, Starting) | (New, Closed) | (Starting, Running) | (Starting, Closing) | (Running, Closing) | (Closing, Closed)
        )
    }
}

/// An atomic lifecycle gate, shared between the public handle and the core task.
///
/// RPC handlers accept requests only while `Running`, with a narrow allowance for
/// AppendEntries/InstallSnapshot to arrive during `Starting`; everything else fails
/// with `NotReady`.
pub struct LifeCycle {
    state: AtomicU8,
}

impl Default for LifeCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifeCycle {
    pub fn new() -> Self {
        LifeCycle {
            state: AtomicU8::new(LifeCycleState::New as u8),
        }
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> LifeCycleState {
        LifeCycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifeCycleState::Running
    }

    /// Perform the `New -> Starting` transition, rejecting a duplicate start.
    pub fn start(&self) -> RaftResult<()> {
        if self.compare_and_transition(LifeCycleState::New, LifeCycleState::Starting) {
            Ok(())
        } else {
            Err(RaftError::NotReady)
        }
    }

    /// Transition to the given state, failing if the transition is not legal.
    pub fn transition(&self, to: LifeCycleState) -> RaftResult<LifeCycleState> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let from = LifeCycleState::from_u8(cur);
            if !from.may_transition_to(to) {
                return Err(RaftError::NotReady);
            }
            match self.state.compare_exchange(cur, to as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(from),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Atomically transition `from -> to`, returning whether this call performed it.
    pub fn compare_and_transition(&self, from: LifeCycleState, to: LifeCycleState) -> bool {
        if !from.may_transition_to(to) {
            return false;
        }
        self.state.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let lc = LifeCycle::new();
        assert_eq!(LifeCycleState::New, lc.state());
        lc.start().unwrap();
        assert_eq!(LifeCycleState::Starting, lc.state());
        lc.transition(LifeCycleState::Running).unwrap();
        lc.transition(LifeCycleState::Closing).unwrap();
        lc.transition(LifeCycleState::Closed).unwrap();
        assert_eq!(LifeCycleState::Closed, lc.state());
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let lc = LifeCycle::new();
        lc.start().unwrap();
        assert!(lc.start().is_err());
    }

    #[test]
    fn test_never_started_may_close() {
        let lc = LifeCycle::new();
        assert!(lc.compare_and_transition(LifeCycleState::New, LifeCycleState::Closed));
        assert_eq!(LifeCycleState::Closed, lc.state());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let lc = LifeCycle::new();
        assert!(lc.transition(LifeCycleState::Running).is_err());
        lc.start().unwrap();
        assert!(lc.transition(LifeCycleState::Closed).is_err());
        lc.transition(LifeCycleState::Running).unwrap();
        assert!(lc.transition(LifeCycleState::Starting).is_err());
        assert!(lc.transition(LifeCycleState::Running).is_err());
    }

    #[test]
    fn test_starting_may_abort_to_closing() {
        let lc = LifeCycle::new();
        lc.start().unwrap();
        lc.transition(LifeCycleState::Closing).unwrap();
        lc.transition(LifeCycleState::Closed).unwrap();
    }
}
