//! Phase marker files
//!
//! A marker is a named sentinel whose mere existence signals a one-way phase
//! transition: the in-container entrypoint touches `<phase>_started.marker`
//! when a tracked phase begins and `<phase>_completed.marker` when it ends,
//! and never retracts either. The completion poller reads them from the
//! controller-local run layout (the deploy path is identical across hosts).

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Name of the tracked long-running phase
pub const PERFORMANCE_PHASE: &str = "performance";

/// Observed marker state for one phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    /// Completion marker present (start marker state is irrelevant)
    Completed,
    /// Only the start marker is present; carries its creation time
    StartedAt(SystemTime),
    /// Neither marker present
    Absent,
}

/// Reads marker state for one phase. The trait seam lets the poller be
/// tested without a filesystem.
pub trait MarkerView: Send + Sync {
    fn status(&self) -> io::Result<MarkerStatus>;
}

/// Filesystem-backed markers for one phase in one directory
#[derive(Debug, Clone)]
pub struct MarkerSet {
    dir: PathBuf,
    phase: String,
}

impl MarkerSet {
    pub fn new(dir: impl Into<PathBuf>, phase: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            phase: phase.into(),
        }
    }

    pub fn started_path(&self) -> PathBuf {
        self.dir.join(format!("{}_started.marker", self.phase))
    }

    pub fn completed_path(&self) -> PathBuf {
        self.dir.join(format!("{}_completed.marker", self.phase))
    }
}

impl MarkerView for MarkerSet {
    fn status(&self) -> io::Result<MarkerStatus> {
        if self.completed_path().exists() {
            return Ok(MarkerStatus::Completed);
        }
        match std::fs::metadata(self.started_path()) {
            Ok(meta) => Ok(MarkerStatus::StartedAt(meta.modified()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MarkerStatus::Absent),
            Err(e) => Err(e),
        }
    }
}

/// Touch a marker file, creating parent directories as needed. Used by tests
/// and by local (controller-is-rank-0) entrypoints.
pub fn touch_marker(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"")
}
