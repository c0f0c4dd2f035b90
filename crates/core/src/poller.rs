//! Run completion polling and retry classification
//!
//! Completion detection is poll-based: on a fixed interval the poller checks
//! PID liveness across all target hosts through the cluster executor, and the
//! run leaves `Running` only when every host reports the recorded process
//! dead, or when a global wall-clock ceiling is exceeded; the ceiling forces
//! an abort regardless of marker state so one stuck case cannot deadlock the
//! pipeline.
//!
//! Once the process is dead everywhere, phase markers decide the outcome:
//! a completion marker wins unconditionally; a lone start marker means the
//! run was interrupted mid-phase (retry-eligible while younger than the
//! interruption threshold, a genuine timeout otherwise); no markers at all
//! means the task died before entering any tracked phase.
//!
//! The clock and sleep are injectable so tests can simulate time passage
//! without real delays.

use crate::cluster::{ClusterExecutor, HostSpec};
use crate::config::Timeouts;
use crate::markers::{MarkerStatus, MarkerView};
use crate::run::{Run, RunVerdict};
use async_trait::async_trait;
use shell_words::quote;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Injectable time source for the poll loop
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock backed by tokio's timer
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Classification of a run that has left the `Running` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Final-phase marker present
    Success,
    /// Interrupted mid-phase, young enough to re-dispatch
    Retry,
    /// Phase ran past the interruption threshold
    TimedOut,
    /// No tracked phase was ever entered, or the global ceiling fired
    Aborted,
}

/// Classify a finished run from its marker state
///
/// The completion marker wins regardless of anything else. A lone start
/// marker is an interruption: retry-eligible when its age is below
/// `interruption_threshold`, a timeout at or beyond it. No markers means the
/// task failed before entering the tracked phase.
pub fn classify(
    status: MarkerStatus,
    now: SystemTime,
    interruption_threshold: Duration,
) -> Classification {
    match status {
        MarkerStatus::Completed => Classification::Success,
        MarkerStatus::StartedAt(started) => {
            let elapsed = now.duration_since(started).unwrap_or_default();
            if elapsed >= interruption_threshold {
                Classification::TimedOut
            } else {
                Classification::Retry
            }
        }
        MarkerStatus::Absent => Classification::Aborted,
    }
}

/// Bounded retry policy for interrupted runs
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

/// What the pipeline should do with a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Tear down, re-prepare, re-dispatch with a fresh PID path
    Redispatch,
    /// Terminal; proceed to teardown and collection
    Stop(RunVerdict),
}

impl RetryPolicy {
    /// Decide the next step for `attempt` (0-based) given a classification.
    /// Across the lifetime of one run this never yields more than
    /// `max_retries` re-dispatches; an exhausted retry becomes a timeout.
    pub fn decide(&self, attempt: u32, classification: Classification) -> RetryDecision {
        match classification {
            Classification::Success => RetryDecision::Stop(RunVerdict::Success),
            Classification::TimedOut => RetryDecision::Stop(RunVerdict::TimedOut),
            Classification::Aborted => RetryDecision::Stop(RunVerdict::Aborted),
            Classification::Retry => {
                if attempt < self.max_retries {
                    RetryDecision::Redispatch
                } else {
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        "retry budget exhausted"
                    );
                    RetryDecision::Stop(RunVerdict::TimedOut)
                }
            }
        }
    }
}

/// Poll-loop thresholds
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Sleep between liveness checks
    pub interval: Duration,
    /// Wall-clock ceiling per attempt
    pub global_ceiling: Duration,
    /// Interruption-vs-timeout split for a lone start marker
    pub interruption_threshold: Duration,
    /// Per-host bound for one liveness check
    pub liveness_timeout: Duration,
}

impl From<&Timeouts> for PollSettings {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            interval: timeouts.poll_interval(),
            global_ceiling: timeouts.global_ceiling(),
            interruption_threshold: timeouts.interruption_threshold(),
            liveness_timeout: timeouts.exec_timeout(),
        }
    }
}

/// Drives one dispatched attempt to a classification
pub struct CompletionPoller {
    executor: Arc<dyn ClusterExecutor>,
    clock: Arc<dyn Clock>,
    settings: PollSettings,
}

impl CompletionPoller {
    pub fn new(
        executor: Arc<dyn ClusterExecutor>,
        clock: Arc<dyn Clock>,
        settings: PollSettings,
    ) -> Self {
        Self {
            executor,
            clock,
            settings,
        }
    }

    /// The per-host PID liveness probe for a run's current attempt
    ///
    /// Succeeds only while the PID recorded by this attempt is alive inside
    /// the container; a missing PID file counts as dead.
    pub fn liveness_command(run: &Run) -> String {
        let pid = quote(&run.pid_path.display().to_string()).into_owned();
        let check = format!("test -f {pid} && kill -0 \"$(cat {pid})\"");
        format!(
            "docker exec {} sh -c {}",
            quote(&run.container),
            quote(&check)
        )
    }

    /// Wait until this attempt leaves `Running` and classify it
    ///
    /// Never fails: an unreadable marker directory classifies as an abort so
    /// the caller always proceeds to teardown.
    pub async fn wait(
        &self,
        run: &Run,
        hosts: &[HostSpec],
        markers: &dyn MarkerView,
    ) -> Classification {
        let liveness = Self::liveness_command(run);
        let started = self.clock.now();
        debug!(
            case = %run.case,
            attempt = run.attempt,
            pid_file = %run.pid_path.display(),
            "polling for completion"
        );

        let mut polls: u64 = 0;
        loop {
            let elapsed = self
                .clock
                .now()
                .duration_since(started)
                .unwrap_or_default();
            if elapsed >= self.settings.global_ceiling {
                warn!(
                    case = %run.case,
                    elapsed_s = elapsed.as_secs(),
                    "global ceiling exceeded, forcing abort"
                );
                return Classification::Aborted;
            }

            let report = self
                .executor
                .run_blocking(&liveness, hosts, self.settings.liveness_timeout)
                .await;
            if report.all_failed() {
                // Process dead on every host; markers decide what that means.
                let status = match markers.status() {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(case = %run.case, "marker state unreadable: {}", e);
                        return Classification::Aborted;
                    }
                };
                let classification =
                    classify(status, self.clock.now(), self.settings.interruption_threshold);
                info!(
                    case = %run.case,
                    attempt = run.attempt,
                    ?classification,
                    "run left the running state"
                );
                return classification;
            }

            polls += 1;
            // Periodic heartbeat so long waits are visible in the log.
            if polls % 60 == 0 {
                info!(
                    case = %run.case,
                    elapsed_s = elapsed.as_secs(),
                    alive_hosts = %report.succeeded_hosts().join(","),
                    "still waiting for task processes to finish"
                );
            }
            self.clock.sleep(self.settings.interval).await;
        }
    }
}
