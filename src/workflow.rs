//! Run state machine
//!
//! Tracks progress through: cloned -> running(i) -> analyzing -> patching ->
//! applying -> verifying -> committing -> running(i+1) | done

use tracing::{debug, warn};

/// The current phase of a repair run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunPhase {
    /// Nothing cloned yet
    #[default]
    Pending,

    /// Working tree checked out on the fix branch
    Cloned,

    /// Running the suite
    Running { iteration: u32 },

    /// Reading the failure output
    Analyzing { iteration: u32 },

    /// Waiting on the patch service
    Patching { iteration: u32, file: String },

    Applying { iteration: u32, file: String },

    /// Re-running the suite after a patch
    Verifying { iteration: u32, file: String },

    Committing { iteration: u32, file: String },

    Done { passed: bool },
}

impl RunPhase {
    /// Short label for logs
    pub fn status_text(&self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Cloned => "cloned",
            RunPhase::Running { .. } => "running",
            RunPhase::Analyzing { .. } => "analyzing",
            RunPhase::Patching { .. } => "patching",
            RunPhase::Applying { .. } => "applying",
            RunPhase::Verifying { .. } => "verifying",
            RunPhase::Committing { .. } => "committing",
            RunPhase::Done { .. } => "done",
        }
    }

    pub fn iteration(&self) -> Option<u32> {
        match self {
            RunPhase::Running { iteration }
            | RunPhase::Analyzing { iteration }
            | RunPhase::Patching { iteration, .. }
            | RunPhase::Applying { iteration, .. }
            | RunPhase::Verifying { iteration, .. }
            | RunPhase::Committing { iteration, .. } => Some(*iteration),
            _ => None,
        }
    }

    /// The file under repair, if any
    pub fn current_file(&self) -> Option<&str> {
        match self {
            RunPhase::Patching { file, .. }
            | RunPhase::Applying { file, .. }
            | RunPhase::Verifying { file, .. }
            | RunPhase::Committing { file, .. } => Some(file),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor of this phase.
    pub fn can_transition_to(&self, next: &RunPhase) -> bool {
        let same_iteration = self.iteration().is_some() && self.iteration() == next.iteration();
        let next_iteration = |i: u32| next == &RunPhase::Running { iteration: i + 1 };
        match (self, next) {
            (RunPhase::Pending, RunPhase::Cloned) => true,
            (RunPhase::Cloned, RunPhase::Running { iteration: 1 }) => true,
            (RunPhase::Running { .. }, RunPhase::Analyzing { .. }) => same_iteration,
            (RunPhase::Running { .. }, RunPhase::Done { .. }) => true,
            // Any later step may give up on the iteration and start the next one.
            (
                RunPhase::Analyzing { iteration }
                | RunPhase::Patching { iteration, .. }
                | RunPhase::Applying { iteration, .. }
                | RunPhase::Verifying { iteration, .. }
                | RunPhase::Committing { iteration, .. },
                RunPhase::Running { .. },
            ) => next_iteration(*iteration),
            (
                RunPhase::Analyzing { .. }
                | RunPhase::Patching { .. }
                | RunPhase::Applying { .. }
                | RunPhase::Verifying { .. }
                | RunPhase::Committing { .. },
                RunPhase::Done { .. },
            ) => true,
            (RunPhase::Analyzing { .. }, RunPhase::Patching { .. }) => same_iteration,
            (RunPhase::Patching { .. }, RunPhase::Applying { .. }) => same_iteration,
            (RunPhase::Applying { .. }, RunPhase::Verifying { .. }) => same_iteration,
            (RunPhase::Verifying { .. }, RunPhase::Committing { .. }) => same_iteration,
            _ => false,
        }
    }
}

/// Phase tracker for one run
#[derive(Debug, Default)]
pub struct Workflow {
    phase: RunPhase,
    transitions: usize,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    /// Number of phase changes so far
    pub fn transitions(&self) -> usize {
        self.transitions
    }

    /// Move to `next`. Illegal moves are logged and still applied; the run
    /// must never stall on bookkeeping.
    pub fn advance(&mut self, next: RunPhase) {
        if !self.phase.can_transition_to(&next) {
            warn!(
                from = self.phase.status_text(),
                to = next.status_text(),
                "unexpected run phase transition"
            );
        }
        debug!(
            phase = next.status_text(),
            iteration = next.iteration(),
            file = next.current_file(),
            "run phase"
        );
        self.phase = next;
        self.transitions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patching(i: u32) -> RunPhase {
        RunPhase::Patching {
            iteration: i,
            file: "src/app.js".into(),
        }
    }

    #[test]
    fn test_full_iteration_is_legal() {
        let steps = vec![
            RunPhase::Cloned,
            RunPhase::Running { iteration: 1 },
            RunPhase::Analyzing { iteration: 1 },
            patching(1),
            RunPhase::Applying {
                iteration: 1,
                file: "src/app.js".into(),
            },
            RunPhase::Verifying {
                iteration: 1,
                file: "src/app.js".into(),
            },
            RunPhase::Committing {
                iteration: 1,
                file: "src/app.js".into(),
            },
            RunPhase::Running { iteration: 2 },
            RunPhase::Done { passed: true },
        ];
        let mut current = RunPhase::Pending;
        for next in steps {
            assert!(current.can_transition_to(&next), "{:?} -> {:?}", current, next);
            current = next;
        }
        assert_eq!(current, RunPhase::Done { passed: true });
    }

    #[test]
    fn test_iterations_only_move_forward_by_one() {
        let analyzing = RunPhase::Analyzing { iteration: 2 };
        assert!(analyzing.can_transition_to(&RunPhase::Running { iteration: 3 }));
        assert!(!analyzing.can_transition_to(&RunPhase::Running { iteration: 2 }));
        assert!(!analyzing.can_transition_to(&RunPhase::Running { iteration: 5 }));
        assert!(!analyzing.can_transition_to(&patching(3)));
    }

    #[test]
    fn test_cannot_skip_clone_or_leave_done() {
        assert!(!RunPhase::Pending.can_transition_to(&RunPhase::Running { iteration: 1 }));
        assert!(!RunPhase::Done { passed: false }.can_transition_to(&RunPhase::Cloned));
    }

    #[test]
    fn test_workflow_tracks_phase() {
        let mut workflow = Workflow::new();
        workflow.advance(RunPhase::Cloned);
        workflow.advance(patching(1));
        assert_eq!(workflow.phase().current_file(), Some("src/app.js"));
        assert_eq!(workflow.phase().iteration(), Some(1));
        assert_eq!(workflow.transitions(), 2);
    }
}
