//! Per-segment retry state machine:
//! Pending → InFlight → Succeeded | TransientFailed(n) | FatalFailed.
//! TransientFailed(n) → InFlight while attempts remain, else Exhausted(n).
//! Any unresolved state may move to Cancelled.

use serde::Serialize;
use tracing::warn;

use crate::translate::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "attempts")]
pub enum SegmentState {
    Pending,
    InFlight,
    Succeeded,
    /// Failed `n` attempts so far, all transient.
    TransientFailed(u32),
    /// Gave up after `n` transient failures.
    Exhausted(u32),
    FatalFailed,
    Cancelled,
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentState::Pending => write!(f, "Pending"),
            SegmentState::InFlight => write!(f, "InFlight"),
            SegmentState::Succeeded => write!(f, "Succeeded"),
            SegmentState::TransientFailed(n) => write!(f, "TransientFailed({n})"),
            SegmentState::Exhausted(n) => write!(f, "Exhausted({n})"),
            SegmentState::FatalFailed => write!(f, "FatalFailed"),
            SegmentState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl SegmentState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: SegmentState) -> bool {
        matches!(
            (self, next),
            (SegmentState::Pending, SegmentState::InFlight)
                | (SegmentState::InFlight, SegmentState::Succeeded)
                | (SegmentState::InFlight, SegmentState::TransientFailed(_))
                | (SegmentState::InFlight, SegmentState::FatalFailed)
                | (SegmentState::TransientFailed(_), SegmentState::InFlight)
                | (SegmentState::TransientFailed(_), SegmentState::Exhausted(_))
                | (SegmentState::Pending, SegmentState::Cancelled)
                | (SegmentState::InFlight, SegmentState::Cancelled)
                | (SegmentState::TransientFailed(_), SegmentState::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SegmentState::Succeeded
                | SegmentState::Exhausted(_)
                | SegmentState::FatalFailed
                | SegmentState::Cancelled
        )
    }

    /// Failure kind of a failed terminal state.
    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            SegmentState::Exhausted(_) => Some(FailureKind::Transient),
            SegmentState::FatalFailed => Some(FailureKind::Fatal),
            _ => None,
        }
    }
}

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub index: usize,
    pub from: SegmentState,
    pub to: SegmentState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "segment {}: invalid transition {} -> {}",
            self.index, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry; `failed` attempts so far.
    Retry { failed: u32 },
    /// Terminal; the segment failed with this kind.
    GiveUp(FailureKind),
}

/// Tracks one segment through its attempts and owns the attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    index: usize,
    state: SegmentState,
    attempts: u32,
    max_attempts: u32,
}

impl RetryTracker {
    pub fn new(index: usize, max_attempts: u32) -> Self {
        Self {
            index,
            state: SegmentState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Backend calls issued so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transition(&mut self, next: SegmentState) -> Result<SegmentState, TransitionError> {
        if !self.state.can_transition_to(next) {
            let err = TransitionError {
                index: self.index,
                from: self.state,
                to: next,
            };
            warn!(index = self.index, from = %err.from, to = %err.to, "invalid segment transition");
            return Err(err);
        }
        if next == SegmentState::InFlight {
            self.attempts += 1;
        }
        self.state = next;
        Ok(next)
    }

    /// Enter InFlight for the next backend call; returns its attempt number.
    pub fn start_attempt(&mut self) -> Result<u32, TransitionError> {
        self.transition(SegmentState::InFlight)?;
        Ok(self.attempts)
    }

    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.transition(SegmentState::Succeeded).map(|_| ())
    }

    /// Record a failed attempt and decide whether another one is allowed.
    pub fn fail(&mut self, kind: FailureKind) -> Result<RetryDecision, TransitionError> {
        match kind {
            FailureKind::Fatal => {
                self.transition(SegmentState::FatalFailed)?;
                Ok(RetryDecision::GiveUp(FailureKind::Fatal))
            }
            FailureKind::Transient => {
                self.transition(SegmentState::TransientFailed(self.attempts))?;
                if self.attempts < self.max_attempts {
                    return Ok(RetryDecision::Retry {
                        failed: self.attempts,
                    });
                }
                self.transition(SegmentState::Exhausted(self.attempts))?;
                Ok(RetryDecision::GiveUp(FailureKind::Transient))
            }
        }
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(SegmentState::Cancelled).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut t = RetryTracker::new(0, 3);
        assert_eq!(t.start_attempt().unwrap(), 1);
        t.succeed().unwrap();
        assert_eq!(t.attempts(), 1);
        assert!(t.state().is_terminal());
        assert_eq!(t.state().failure_kind(), None);
    }

    #[test]
    fn transient_failures_retry_until_exhausted() {
        let mut t = RetryTracker::new(3, 2);
        t.start_attempt().unwrap();
        assert_eq!(
            t.fail(FailureKind::Transient).unwrap(),
            RetryDecision::Retry { failed: 1 }
        );
        assert_eq!(t.state(), SegmentState::TransientFailed(1));

        assert_eq!(t.start_attempt().unwrap(), 2);
        assert_eq!(
            t.fail(FailureKind::Transient).unwrap(),
            RetryDecision::GiveUp(FailureKind::Transient)
        );
        assert_eq!(t.state(), SegmentState::Exhausted(2));
        assert_eq!(t.state().failure_kind(), Some(FailureKind::Transient));
        assert!(t.start_attempt().is_err());
    }

    #[test]
    fn fatal_failure_is_terminal_at_once() {
        let mut t = RetryTracker::new(0, 5);
        t.start_attempt().unwrap();
        assert_eq!(
            t.fail(FailureKind::Fatal).unwrap(),
            RetryDecision::GiveUp(FailureKind::Fatal)
        );
        assert_eq!(t.state().failure_kind(), Some(FailureKind::Fatal));
        assert_eq!(t.attempts(), 1);
    }

    #[test]
    fn cancel_from_any_unresolved_state() {
        let mut pending = RetryTracker::new(0, 3);
        pending.cancel().unwrap();

        let mut waiting = RetryTracker::new(1, 3);
        waiting.start_attempt().unwrap();
        waiting.fail(FailureKind::Transient).unwrap();
        waiting.cancel().unwrap();
        assert_eq!(waiting.state(), SegmentState::Cancelled);

        let mut done = RetryTracker::new(2, 3);
        done.start_attempt().unwrap();
        done.succeed().unwrap();
        assert!(done.cancel().is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            SegmentState::Succeeded,
            SegmentState::Exhausted(3),
            SegmentState::FatalFailed,
            SegmentState::Cancelled,
        ] {
            assert!(!terminal.can_transition_to(SegmentState::InFlight));
            assert!(!terminal.can_transition_to(SegmentState::Cancelled));
        }
    }

    #[test]
    fn pending_cannot_skip_to_success() {
        let mut t = RetryTracker::new(0, 3);
        let err = t.succeed().unwrap_err();
        assert_eq!(err.from, SegmentState::Pending);
        assert_eq!(t.state(), SegmentState::Pending);
        assert!(err.to_string().contains("Pending -> Succeeded"));
    }
}
