//! Run records and the run state machine
//!
//! A `Run` is one instance of executing a case, carried through dispatch,
//! polling, retries, and teardown. The attempt counter only increases, and
//! every attempt mints a fresh PID-file path so a stale liveness read from a
//! prior attempt can never be mistaken for the current attempt's state.

use crate::layout::RunLayout;
use std::path::PathBuf;

/// Phase of a run. Strictly ordered; no state is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Task launched, grace period before polling
    Dispatched,
    /// Poll loop active
    Running,
    /// Terminal
    Finished(RunVerdict),
}

/// Terminal classification of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    /// Final-phase marker present
    Success,
    /// Interrupted mid-phase and retry budget exhausted, or the phase
    /// genuinely exceeded the interruption threshold
    TimedOut,
    /// Died before entering any tracked phase, or global ceiling exceeded
    Aborted,
}

impl RunVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunVerdict::Success => "success",
            RunVerdict::TimedOut => "timed_out",
            RunVerdict::Aborted => "aborted",
        }
    }
}

/// One run of a single configured case
#[derive(Debug, Clone)]
pub struct Run {
    /// Case identity, verbatim from config
    pub case: String,
    /// Container name unique to this case
    pub container: String,
    /// Attempt counter; 0 is the initial dispatch
    pub attempt: u32,
    /// PID-file path of the current attempt
    pub pid_path: PathBuf,
    /// Current phase
    pub phase: RunPhase,
}

impl Run {
    /// Create a run for its initial attempt
    pub fn new(case: impl Into<String>, container: impl Into<String>, layout: &RunLayout) -> Self {
        let case = case.into();
        let pid_path = layout.pid_file(&case, 0);
        Self {
            case,
            container: container.into(),
            attempt: 0,
            pid_path,
            phase: RunPhase::Dispatched,
        }
    }

    /// Advance to the next attempt: increment the counter and mint a fresh
    /// PID-file path. Resets the phase to Dispatched.
    pub fn next_attempt(&mut self, layout: &RunLayout) {
        self.attempt += 1;
        self.pid_path = layout.pid_file(&self.case, self.attempt);
        self.phase = RunPhase::Dispatched;
    }

    pub fn mark_running(&mut self) {
        debug_assert_eq!(self.phase, RunPhase::Dispatched);
        self.phase = RunPhase::Running;
    }

    pub fn finish(&mut self, verdict: RunVerdict) {
        self.phase = RunPhase::Finished(verdict);
    }
}
