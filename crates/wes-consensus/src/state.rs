//! Per-height aggregation state machine
//!
//! One node runs at most one aggregation flow at a time; the pair
//! `(state, current_height)` is a single tuple behind one mutex so readers
//! never observe a torn update.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ConsensusError, ConsensusResult};

/// The aggregation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationState {
    /// No flow in progress
    Idle,
    /// Flow claimed, window not yet open
    Listening,
    /// Collection window open
    Collecting,
    /// Computing distances
    Evaluating,
    /// Choosing the winner and producing the proof
    Selecting,
    /// Publishing the result and committing locally
    Distributing,
    /// Flow suspended
    Paused,
    /// Flow failed; the only exit is Idle
    Error,
}

impl std::fmt::Display for AggregationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AggregationState::Idle => "idle",
            AggregationState::Listening => "listening",
            AggregationState::Collecting => "collecting",
            AggregationState::Evaluating => "evaluating",
            AggregationState::Selecting => "selecting",
            AggregationState::Distributing => "distributing",
            AggregationState::Paused => "paused",
            AggregationState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Whether `from -> to` is a legal edge.
///
/// The middle states (Collecting, Evaluating, Selecting) have no direct
/// edge to Idle; recovery goes through Error.
fn is_legal(from: AggregationState, to: AggregationState) -> bool {
    use AggregationState::*;
    matches!(
        (from, to),
        (Idle, Listening)
            | (Idle, Error)
            | (Listening, Collecting)
            | (Listening, Paused)
            | (Listening, Error)
            | (Listening, Idle)
            | (Collecting, Evaluating)
            | (Collecting, Paused)
            | (Collecting, Error)
            | (Evaluating, Selecting)
            | (Evaluating, Paused)
            | (Evaluating, Error)
            | (Selecting, Distributing)
            | (Selecting, Paused)
            | (Selecting, Error)
            | (Distributing, Idle)
            | (Distributing, Error)
            | (Paused, Listening)
            | (Paused, Idle)
            | (Paused, Error)
            | (Error, Idle)
    )
}

struct StateInner {
    state: AggregationState,
    height: u64,
}

/// Single-writer state machine for the aggregation flow.
pub struct StateMachine {
    inner: Mutex<StateInner>,
}

impl StateMachine {
    /// Creates a machine in `Idle` at height 0.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: AggregationState::Idle,
                height: 0,
            }),
        }
    }

    /// Atomic read of `(state, height)`.
    pub fn snapshot(&self) -> (AggregationState, u64) {
        let inner = self.inner.lock();
        (inner.state, inner.height)
    }

    /// Current state.
    pub fn current_state(&self) -> AggregationState {
        self.inner.lock().state
    }

    /// Height the machine is working on.
    pub fn current_height(&self) -> u64 {
        self.inner.lock().height
    }

    /// Points the machine at a height. Shares the state mutex so the pair
    /// stays consistent.
    pub fn set_current_height(&self, height: u64) {
        self.inner.lock().height = height;
    }

    /// Moves to `to`, failing on any edge outside the transition table.
    /// An illegal request is a programming error in the caller, not a
    /// data condition.
    pub fn transition_to(&self, to: AggregationState) -> ConsensusResult<()> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from == to {
            return Ok(());
        }
        if !is_legal(from, to) {
            return Err(ConsensusError::InvalidTransition { from, to });
        }
        debug!(height = inner.height, %from, %to, "state transition");
        inner.state = to;
        Ok(())
    }

    /// Drives the machine back to `Idle` in at most two transitions,
    /// detouring through `Error` where no direct edge exists.
    pub fn ensure_idle(&self) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from == AggregationState::Idle {
            return;
        }
        if !is_legal(from, AggregationState::Idle) {
            // Middle states have no direct edge; take the Error detour.
            warn!(height = inner.height, %from, "recovering to idle via error");
            inner.state = AggregationState::Error;
        } else {
            debug!(height = inner.height, %from, "recovered to idle");
        }
        inner.state = AggregationState::Idle;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AggregationState::*;

    const ALL: [AggregationState; 8] = [
        Idle,
        Listening,
        Collecting,
        Evaluating,
        Selecting,
        Distributing,
        Paused,
        Error,
    ];

    fn machine_in(state: AggregationState) -> StateMachine {
        let m = StateMachine::new();
        let path = match state {
            Idle => vec![],
            Listening => vec![Listening],
            Collecting => vec![Listening, Collecting],
            Evaluating => vec![Listening, Collecting, Evaluating],
            Selecting => vec![Listening, Collecting, Evaluating, Selecting],
            Distributing => vec![Listening, Collecting, Evaluating, Selecting, Distributing],
            Paused => vec![Listening, Paused],
            Error => vec![Error],
        };
        for step in path {
            m.transition_to(step).unwrap();
        }
        assert_eq!(m.current_state(), state);
        m
    }

    #[test]
    fn test_happy_path_sequence() {
        let m = StateMachine::new();
        m.set_current_height(42);
        for step in [
            Listening,
            Collecting,
            Evaluating,
            Selecting,
            Distributing,
            Idle,
        ] {
            m.transition_to(step).unwrap();
        }
        assert_eq!(m.snapshot(), (Idle, 42));
    }

    #[test]
    fn test_middle_states_cannot_jump_to_idle() {
        for state in [Collecting, Evaluating, Selecting] {
            let m = machine_in(state);
            let err = m.transition_to(Idle).unwrap_err();
            assert!(matches!(err, ConsensusError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn test_error_only_exits_to_idle() {
        let m = machine_in(Error);
        for target in [Listening, Collecting, Evaluating, Selecting, Distributing, Paused] {
            assert!(m.transition_to(target).is_err());
        }
        m.transition_to(Idle).unwrap();
    }

    #[test]
    fn test_skip_transitions_rejected() {
        let m = machine_in(Listening);
        assert!(m.transition_to(Evaluating).is_err());
        assert!(m.transition_to(Selecting).is_err());
        assert!(m.transition_to(Distributing).is_err());
    }

    #[test]
    fn test_ensure_idle_from_every_state() {
        for state in ALL {
            let m = machine_in(state);
            m.ensure_idle();
            assert_eq!(m.current_state(), Idle, "from {:?}", state);
        }
    }

    #[test]
    fn test_self_transition_is_noop() {
        let m = machine_in(Collecting);
        m.transition_to(Collecting).unwrap();
        assert_eq!(m.current_state(), Collecting);
    }

    #[test]
    fn test_paused_resumes_listening() {
        let m = machine_in(Paused);
        m.transition_to(Listening).unwrap();
        assert_eq!(m.current_state(), Listening);
    }

    #[test]
    fn test_snapshot_is_atomic_pair() {
        let m = StateMachine::new();
        m.set_current_height(7);
        m.transition_to(Listening).unwrap();
        assert_eq!(m.snapshot(), (Listening, 7));
    }
}
