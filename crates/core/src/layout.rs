//! On-disk run layout
//!
//! One directory tree per run timestamp, identical on every host and on the
//! controller:
//!
//! ```text
//! <log_root>/run<YYYYmmddHHMMSS>/
//!   start_task_<case>.pid              (per-attempt; retries get _retry<N>)
//!   <case>/
//!     <host>_noderank<K>/
//!       task.log.txt                   task stdout/stderr
//!       result.log.txt                 structured result log
//!       correctness.log.txt            correctness log
//!       *_started.marker, *_completed.marker
//! ```
//!
//! Marker files exist purely as boolean signals; their content is irrelevant.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Task stdout/stderr log file name
pub const TASK_LOG: &str = "task.log.txt";
/// Structured result log file name
pub const RESULT_LOG: &str = "result.log.txt";
/// Correctness log file name
pub const CORRECTNESS_LOG: &str = "correctness.log.txt";
/// Merged result document file name
pub const RESULT_JSON: &str = "result.json";
/// Per-host detail summary file name
pub const DETAIL_JSON: &str = "detail_result.json";

/// Sanitize a case identity for use in file names (`:` is not portable)
pub fn safe_case_name(case: &str) -> String {
    case.replace(':', "_")
}

/// Sanitize a case identity for use in container names
pub fn container_safe_case_name(case: &str) -> String {
    case.replace(':', "-")
}

/// Directory layout of one run
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    /// Mint a fresh layout under `log_root` named by `timestamp`
    pub fn new(log_root: &Path, timestamp: DateTime<Local>) -> Self {
        let dir = format!("run{}", timestamp.format("%Y%m%d%H%M%S"));
        Self {
            root: log_root.join(dir),
        }
    }

    /// Reopen an existing layout root
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-case log directory; case identity is kept verbatim
    pub fn case_dir(&self, case: &str) -> PathBuf {
        self.root.join(case)
    }

    /// Per-host directory within a case, named by address and node rank
    pub fn host_dir(&self, case: &str, host: &str, rank: usize) -> PathBuf {
        self.case_dir(case).join(format!("{}_noderank{}", host, rank))
    }

    /// PID-file path for a given attempt of a case. Attempt 0 is the initial
    /// dispatch; retries append a `_retry<N>` suffix so no two attempts of
    /// the same run ever share a path.
    pub fn pid_file(&self, case: &str, attempt: u32) -> PathBuf {
        let safe = safe_case_name(case);
        let name = if attempt == 0 {
            format!("start_task_{}.pid", safe)
        } else {
            format!("start_task_{}_retry{}.pid", safe, attempt)
        };
        self.root.join(name)
    }
}
