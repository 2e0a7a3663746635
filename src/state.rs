//! Observable session status and its transition rules.
//!
//! Multiple async sources (connection callbacks, data-channel events,
//! signaling pushes) race to report status, so invalid transitions are
//! silent no-ops and finalization fires at most once per session.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

/// The one status exposed to the caller. The last three are terminal: once
/// entered, no further transition is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Transferring,
    Completed,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Error | SessionStatus::Cancelled
        )
    }

    /// The allowed-next table. Self-transitions are allowed everywhere so
    /// duplicate reports of the same state stay no-ops rather than errors.
    fn allows(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Idle => matches!(next, Idle | Connecting),
            Connecting => matches!(next, Connecting | Transferring | Completed | Error | Cancelled),
            Transferring => matches!(next, Transferring | Completed | Error | Cancelled),
            Completed | Error | Cancelled => next == self,
        }
    }
}

struct Inner {
    status: SessionStatus,
    finalized: bool,
    seen: HashSet<String>,
}

/// Tracks the session status, guarding the transition table, exactly-once
/// finalization, and notification dedup.
///
/// Interior mutability with a plain mutex: every mutation is a short
/// critical section and nothing is held across an await.
pub struct StatusTracker {
    inner: Mutex<Inner>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: SessionStatus::Idle,
                finalized: false,
                seen: HashSet::new(),
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.inner.lock() {
            Ok(inner) => inner.status,
            Err(poisoned) => poisoned.into_inner().status,
        }
    }

    /// Apply a transition if the table allows it. Returns whether the status
    /// actually changed.
    pub fn transition(&self, next: SessionStatus) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !inner.status.allows(next) {
            debug!(from = ?inner.status, to = ?next, "ignoring invalid status transition");
            return false;
        }
        let changed = inner.status != next;
        inner.status = next;
        changed
    }

    /// Enter a terminal status. Only the first call per session wins; later
    /// calls (even with a different terminal status) change nothing and
    /// return false.
    pub fn finalize(&self, terminal: SessionStatus) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.finalized || !inner.status.allows(terminal) {
            return false;
        }
        inner.status = terminal;
        inner.finalized = true;
        true
    }

    /// One-shot notification dedup: returns true the first time a tag is
    /// seen, false on every repeat. Racing callbacks describing the same
    /// underlying event pick one winner through this.
    pub fn note_once(&self, tag: &str) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.seen.insert(tag.to_string())
    }

    /// Back to `idle`, forgetting finalization and seen notifications. Only
    /// an explicit reset leaves a terminal state.
    pub fn reset(&self) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.status = SessionStatus::Idle;
        inner.finalized = false;
        inner.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let tracker = StatusTracker::new();
        assert_eq!(tracker.status(), SessionStatus::Idle);
        assert!(tracker.transition(SessionStatus::Connecting));
        assert!(tracker.transition(SessionStatus::Transferring));
        assert!(tracker.finalize(SessionStatus::Completed));
        assert_eq!(tracker.status(), SessionStatus::Completed);
    }

    #[test]
    fn invalid_transition_is_noop() {
        let tracker = StatusTracker::new();
        tracker.transition(SessionStatus::Connecting);
        tracker.finalize(SessionStatus::Completed);
        assert!(!tracker.transition(SessionStatus::Connecting));
        assert_eq!(tracker.status(), SessionStatus::Completed);
    }

    #[test]
    fn idle_cannot_jump_to_transferring() {
        let tracker = StatusTracker::new();
        assert!(!tracker.transition(SessionStatus::Transferring));
        assert_eq!(tracker.status(), SessionStatus::Idle);
    }

    #[test]
    fn finalize_is_exactly_once() {
        let tracker = StatusTracker::new();
        tracker.transition(SessionStatus::Connecting);
        assert!(tracker.finalize(SessionStatus::Error));
        // A second finalize with a different terminal status changes nothing.
        assert!(!tracker.finalize(SessionStatus::Cancelled));
        assert_eq!(tracker.status(), SessionStatus::Error);
    }

    #[test]
    fn self_transition_reports_unchanged() {
        let tracker = StatusTracker::new();
        tracker.transition(SessionStatus::Connecting);
        assert!(!tracker.transition(SessionStatus::Connecting));
    }

    #[test]
    fn note_once_dedups() {
        let tracker = StatusTracker::new();
        assert!(tracker.note_once("cancelled:receiver"));
        assert!(!tracker.note_once("cancelled:receiver"));
        assert!(tracker.note_once("cancelled:sender"));
    }

    #[test]
    fn reset_leaves_terminal_state() {
        let tracker = StatusTracker::new();
        tracker.transition(SessionStatus::Connecting);
        tracker.finalize(SessionStatus::Cancelled);
        tracker.reset();
        assert_eq!(tracker.status(), SessionStatus::Idle);
        assert!(tracker.transition(SessionStatus::Connecting));
        assert!(tracker.note_once("cancelled:receiver"));
    }
}
