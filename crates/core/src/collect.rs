//! Per-host log collection
//!
//! After a run reaches a terminal state, each case's log tree is pulled back
//! from every targeted host into the controller-local run layout. A host's
//! collection failure is logged and skipped; it never blocks collection from
//! the other hosts or the other cases.

use crate::cluster::{ClusterExecutor, HostReport, HostSpec};
use crate::layout::RunLayout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct LogCollector {
    executor: Arc<dyn ClusterExecutor>,
    timeout: Duration,
}

impl LogCollector {
    pub fn new(executor: Arc<dyn ClusterExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Pull one case's log directory from every host. The layout path is
    /// identical on hosts and controller, so remote and local coincide.
    pub async fn collect_case(
        &self,
        layout: &RunLayout,
        case: &str,
        hosts: &[HostSpec],
    ) -> HostReport {
        let case_dir = layout.case_dir(case);
        let report = self
            .executor
            .collect_tree(&case_dir, &case_dir, hosts, self.timeout)
            .await;
        if report.failed_hosts().is_empty() {
            info!(case, dir = %case_dir.display(), "collected logs from all hosts");
        } else {
            warn!(
                case,
                hosts = %report.failed_join(),
                "log collection failed on some hosts, skipping them"
            );
        }
        report
    }

    /// Collect every case; returns true only when every host of every case
    /// delivered its tree.
    pub async fn collect_all(
        &self,
        layout: &RunLayout,
        cases: &[String],
        hosts: &[HostSpec],
    ) -> bool {
        let mut got_all = true;
        for case in cases {
            let report = self.collect_case(layout, case, hosts).await;
            if !report.failed_hosts().is_empty() {
                got_all = false;
            }
        }
        if got_all {
            info!(root = %layout.root().display(), "all logs collected");
        } else {
            warn!(root = %layout.root().display(), "not all logs could be collected");
        }
        got_all
    }
}
