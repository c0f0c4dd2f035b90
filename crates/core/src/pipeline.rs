//! Session pipeline: prepare, dispatch, poll, collect
//!
//! One session drives every configured case through the same sequence,
//! strictly one case at a time; all host-level parallelism lives inside the
//! cluster executor calls. Collaborators are threaded through an explicit
//! context rather than process-wide state, so tests can swap the executor
//! and the clock.
//!
//! Failure handling follows a fixed severity order: unreachable hosts and a
//! missing deploy path abort the session before any case runs; a container
//! or dispatch failure skips that case only; retry exhaustion records a
//! timeout verdict and proceeds to teardown and collection like any other
//! terminal state.

use crate::cluster::{ClusterExecutor, HostSpec};
use crate::collect::LogCollector;
use crate::config::FleetConfig;
use crate::container::{ContainerManager, ContainerSpec, LaunchPlan};
use crate::errors::{ConfigError, FleetError, Result, RunError, SshError};
use crate::launcher::{TaskLauncher, TaskSpec};
use crate::layout::{container_safe_case_name, RunLayout, DETAIL_JSON, RESULT_JSON};
use crate::markers::{MarkerSet, PERFORMANCE_PHASE};
use crate::poller::{Clock, CompletionPoller, PollSettings, RetryDecision, RetryPolicy};
use crate::results::MergedResults;
use crate::run::{Run, RunVerdict};
use chrono::Local;
use serde_json::{json, Value};
use shell_words::quote;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result fields every aggregated entry is expected to carry; missing ones
/// render as the "N/A" sentinel
const EXPECTED_RESULT_FIELDS: &[&str] = &[
    "op_name",
    "dtype",
    "shape_detail",
    "latency",
    "latency_base",
    "ratio",
    "correctness",
];

/// Per-workload-kind strategy: what image to run, how to launch its
/// container, and what to execute inside it.
pub trait Workload: Send + Sync {
    /// Stable kind name used in logs and image names
    fn kind(&self) -> &'static str;

    /// Image reference for a case running under `framework`
    fn image(&self, config: &FleetConfig, framework: &str) -> String;

    /// Launch plan for the image, honoring a custom template when configured
    fn launch_plan(&self, config: &FleetConfig, image: &str) -> LaunchPlan;

    /// In-container task for one case. `attempt` is 0 for the initial
    /// dispatch; re-dispatches get flagged so the entrypoint repeats only the
    /// interrupted phase.
    fn task_spec(
        &self,
        config: &FleetConfig,
        layout: &RunLayout,
        case: &str,
        framework: &str,
        attempt: u32,
    ) -> TaskSpec;
}

/// The standard single-operation benchmark workload
#[derive(Debug, Clone, Default)]
pub struct OperationWorkload;

impl Workload for OperationWorkload {
    fn kind(&self) -> &'static str {
        "operation"
    }

    fn image(&self, config: &FleetConfig, framework: &str) -> String {
        format!(
            "fleetbench-{}-{}-{}:latest",
            self.kind(),
            config.vendor,
            framework
        )
    }

    fn launch_plan(&self, config: &FleetConfig, image: &str) -> LaunchPlan {
        if let Some(template) = &config.container.custom_launch {
            return LaunchPlan::Template(template.clone());
        }
        LaunchPlan::Spec(ContainerSpec {
            image: image.to_string(),
            workdir: config.deploy_path.clone(),
            // The deploy tree is mounted at its host path so log and marker
            // paths are identical inside and outside the container.
            mounts: vec![(config.deploy_path.clone(), config.deploy_path.clone())],
            shm_size: config.container.shm_size.clone(),
            extra_opts: config.container.extra_opts.clone(),
        })
    }

    fn task_spec(
        &self,
        config: &FleetConfig,
        layout: &RunLayout,
        case: &str,
        framework: &str,
        attempt: u32,
    ) -> TaskSpec {
        let case_dir = layout.case_dir(case);
        let main = config.deploy_path.join("operation/container_main.py");
        let mut entrypoint = vec![
            "python3".to_string(),
            main.display().to_string(),
            "--vendor".to_string(),
            config.vendor.clone(),
            "--case_name".to_string(),
            case.to_string(),
            "--framework".to_string(),
            framework.to_string(),
            "--nproc_per_node".to_string(),
            config.nproc_per_node.to_string(),
            "--log_dir".to_string(),
            case_dir.display().to_string(),
            "--log_level".to_string(),
            config.log_level.clone(),
        ];
        entrypoint.extend(config.extra_args.iter().cloned());
        if attempt > 0 {
            entrypoint.push("--retry_performance_only".to_string());
        }

        TaskSpec {
            entrypoint,
            requirements: Some(config.deploy_path.join("operation/requirements.txt")),
            env_script: Some(
                config
                    .deploy_path
                    .join(format!("vendors/{}/env.sh", config.vendor)),
            ),
            log_dir: case_dir,
        }
    }
}

/// Unique container name for one case under one image. Sanitized so repeated
/// sessions and neighboring cases can never collide.
pub fn container_name(image: &str, case: &str) -> String {
    let image_part = image.replace(['/', ':'], "-");
    format!(
        "{}-{}-container",
        image_part,
        container_safe_case_name(case)
    )
}

/// Outcome of a single case within a session
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub case: String,
    /// Terminal verdict; absent when the case was skipped before polling
    pub verdict: Option<RunVerdict>,
    /// Attempt counter at the end of the case; 0 means no retry happened
    pub attempts: u32,
    /// Why the case was skipped, when it was
    pub skipped: Option<String>,
}

impl CaseReport {
    fn skipped(case: &str, reason: impl Into<String>) -> Self {
        Self {
            case: case.to_string(),
            verdict: None,
            attempts: 0,
            skipped: Some(reason.into()),
        }
    }
}

/// Outcome of one whole session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub layout_root: std::path::PathBuf,
    pub cases: Vec<CaseReport>,
    /// Every host of every case delivered its log tree
    pub collected_all: bool,
}

impl SessionReport {
    pub fn all_cases_succeeded(&self) -> bool {
        !self.cases.is_empty()
            && self
                .cases
                .iter()
                .all(|c| c.verdict == Some(RunVerdict::Success))
    }
}

/// Collaborators of a session, injected at construction
pub struct OrchestratorContext {
    pub config: FleetConfig,
    pub executor: Arc<dyn ClusterExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// Drives one session over the fleet for one workload
pub struct Pipeline {
    context: OrchestratorContext,
    workload: Box<dyn Workload>,
}

impl Pipeline {
    pub fn new(context: OrchestratorContext, workload: Box<dyn Workload>) -> Self {
        Self { context, workload }
    }

    /// Probe the fleet: reachability plus the deploy path on every host.
    /// Both failures are fatal for a session; `check` exposes this alone.
    pub async fn preflight(&self) -> Result<()> {
        let config = &self.context.config;
        let hosts = config.fleet();

        let report = self.context.executor.healthcheck(&hosts).await;
        if !report.failed_hosts().is_empty() {
            return Err(SshError::Unreachable {
                hosts: report.failed_join(),
            }
            .into());
        }
        info!(hosts = hosts.len(), "all hosts reachable");

        let probe = format!(
            "test -d {}",
            quote(&config.deploy_path.display().to_string())
        );
        let report = self
            .context
            .executor
            .run_blocking(&probe, &hosts, config.timeouts.exec_timeout())
            .await;
        if !report.failed_hosts().is_empty() {
            return Err(ConfigError::DeployPath {
                path: config.deploy_path.display().to_string(),
                hosts: report.failed_join(),
            }
            .into());
        }
        info!(path = %config.deploy_path.display(), "deploy path present on all hosts");
        Ok(())
    }

    /// Run the full session: preflight, then every configured case in order,
    /// then collection and aggregation.
    pub async fn execute(&self) -> Result<SessionReport> {
        self.preflight().await?;
        let layout = RunLayout::new(&self.context.config.log_root(), Local::now());
        self.run_in(&layout).await
    }

    /// Run the per-case portion of a session into an existing layout
    pub async fn run_in(&self, layout: &RunLayout) -> Result<SessionReport> {
        let config = &self.context.config;
        let hosts = config.fleet();
        std::fs::create_dir_all(layout.root()).map_err(RunError::Io)?;
        self.log_banner(layout);
        self.snapshot_config(layout, &hosts).await?;

        let manager =
            ContainerManager::new(self.context.executor.clone(), config.timeouts.clone());
        let launcher = TaskLauncher::new(
            self.context.executor.clone(),
            config.timeouts.exec_timeout(),
        );
        let poller = CompletionPoller::new(
            self.context.executor.clone(),
            self.context.clock.clone(),
            PollSettings::from(&config.timeouts),
        );
        let policy = RetryPolicy {
            max_retries: config.max_retries,
        };

        let mut case_reports = Vec::with_capacity(config.cases.len());
        for (case, framework) in &config.cases {
            let report = self
                .run_case(
                    layout, &hosts, case, framework, &manager, &launcher, &poller, &policy,
                )
                .await?;
            case_reports.push(report);
        }

        let collector = LogCollector::new(
            self.context.executor.clone(),
            config.timeouts.collect_timeout(),
        );
        let cases: Vec<String> = config.cases.keys().cloned().collect();
        let collected_all = collector.collect_all(layout, &cases, &hosts).await;

        self.aggregate(layout, &hosts, &case_reports)?;

        let session = SessionReport {
            layout_root: layout.root().to_path_buf(),
            cases: case_reports,
            collected_all,
        };
        info!(
            root = %session.layout_root.display(),
            succeeded = session.cases.iter().filter(|c| c.verdict == Some(RunVerdict::Success)).count(),
            total = session.cases.len(),
            "session finished"
        );
        Ok(session)
    }

    fn log_banner(&self, layout: &RunLayout) {
        let config = &self.context.config;
        info!(
            workload = self.workload.kind(),
            vendor = %config.vendor,
            hosts = %config.hosts.join(","),
            cases = config.cases.len(),
            log_root = %layout.root().display(),
            max_retries = config.max_retries,
            "session configuration"
        );
        for (case, framework) in &config.cases {
            debug!(case = %case, framework = %framework, "configured case");
        }
    }

    /// Write the resolved config into the run layout and push it to every
    /// host, so each host's log tree records what it was asked to run.
    async fn snapshot_config(&self, layout: &RunLayout, hosts: &[HostSpec]) -> Result<()> {
        let snapshot = layout.root().join("fleet_config.yaml");
        let rendered =
            serde_yaml::to_string(&self.context.config).map_err(|e| FleetError::Internal {
                message: format!("config snapshot serialization failed: {}", e),
            })?;
        std::fs::write(&snapshot, rendered).map_err(RunError::Io)?;

        let report = self
            .context
            .executor
            .sync_file(&snapshot, layout.root(), hosts)
            .await;
        if !report.failed_hosts().is_empty() {
            warn!(
                hosts = %report.failed_join(),
                "config snapshot not delivered to some hosts (ignored)"
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_case(
        &self,
        layout: &RunLayout,
        hosts: &[HostSpec],
        case: &str,
        framework: &str,
        manager: &ContainerManager,
        launcher: &TaskLauncher,
        poller: &CompletionPoller,
        policy: &RetryPolicy,
    ) -> Result<CaseReport> {
        let config = &self.context.config;
        info!(case, framework, "starting case");
        std::fs::create_dir_all(layout.case_dir(case)).map_err(RunError::Io)?;

        if config.clear_caches {
            self.clear_caches(hosts).await;
        }

        let image = self.workload.image(config, framework);
        let plan = self.workload.launch_plan(config, &image);
        let container = container_name(&image, case);

        if !manager.prepare(hosts, &container, &plan).await? {
            warn!(case, container = %container, "container prepare failed, skipping case");
            return Ok(CaseReport::skipped(case, "container prepare failed"));
        }
        let case_dir = layout.case_dir(case);
        self.start_monitors(hosts, &case_dir).await;

        // Markers land in the rank-0 host directory; the log tree is shared,
        // so the controller reads them at the same path.
        let markers = MarkerSet::new(
            layout.host_dir(case, &hosts[0].address, 0),
            PERFORMANCE_PHASE,
        );

        let mut run = Run::new(case, container.clone(), layout);
        let verdict = loop {
            let task = self
                .workload
                .task_spec(config, layout, case, framework, run.attempt);
            let dispatch = launcher.dispatch(&run, &task, hosts).await;
            if dispatch.all_failed() {
                let err = RunError::DispatchFailed {
                    case: case.to_string(),
                    hosts: dispatch.failed_join(),
                };
                warn!(case, "{}, skipping case", err);
                manager.teardown(hosts, &container).await;
                self.stop_monitors(hosts).await;
                return Ok(CaseReport::skipped(case, err.to_string()));
            }

            self.context
                .clock
                .sleep(config.timeouts.dispatch_grace())
                .await;
            run.mark_running();

            let classification = poller.wait(&run, hosts, &markers).await;
            match policy.decide(run.attempt, classification) {
                RetryDecision::Stop(verdict) => break verdict,
                RetryDecision::Redispatch => {
                    info!(case, attempt = run.attempt, "interrupted, re-dispatching");
                    manager.teardown(hosts, &container).await;
                    self.stop_monitors(hosts).await;
                    if !manager.prepare(hosts, &container, &plan).await? {
                        warn!(case, "re-prepare failed, aborting case");
                        break RunVerdict::Aborted;
                    }
                    self.start_monitors(hosts, &case_dir).await;
                    run.next_attempt(layout);
                }
            }
        };
        run.finish(verdict);
        manager.teardown(hosts, &container).await;
        self.stop_monitors(hosts).await;

        info!(case, verdict = verdict.as_str(), attempts = run.attempt, "case finished");
        Ok(CaseReport {
            case: case.to_string(),
            verdict: Some(verdict),
            attempts: run.attempt,
            skipped: None,
        })
    }

    /// System and vendor monitor scripts on every host, resolved under the
    /// deploy path
    fn monitor_scripts(&self) -> [std::path::PathBuf; 2] {
        let config = &self.context.config;
        [
            config.deploy_path.join("utils/sys_monitor.py"),
            config.deploy_path.join(format!(
                "vendors/{}/{}_monitor.py",
                config.vendor, config.vendor
            )),
        ]
    }

    /// Restart the system and vendor monitors fleet-wide, logging into the
    /// case directory. Monitor failures never fail a case.
    async fn start_monitors(&self, hosts: &[HostSpec], case_dir: &std::path::Path) {
        for script in self.monitor_scripts() {
            let cmd = format!(
                "python3 {} -o restart -l {}",
                quote(&script.display().to_string()),
                quote(&case_dir.display().to_string())
            );
            let report = self
                .context
                .executor
                .run_blocking(&cmd, hosts, self.context.config.timeouts.exec_timeout())
                .await;
            if !report.failed_hosts().is_empty() {
                warn!(
                    script = %script.display(),
                    hosts = %report.failed_join(),
                    "monitor start failed (ignored)"
                );
            }
        }
    }

    /// Stop the monitors fleet-wide, again best-effort
    async fn stop_monitors(&self, hosts: &[HostSpec]) {
        for script in self.monitor_scripts() {
            let cmd = format!("python3 {} -o stop", quote(&script.display().to_string()));
            let report = self
                .context
                .executor
                .run_blocking(&cmd, hosts, self.context.config.timeouts.exec_timeout())
                .await;
            if !report.failed_hosts().is_empty() {
                warn!(
                    script = %script.display(),
                    hosts = %report.failed_join(),
                    "monitor stop failed (ignored)"
                );
            }
        }
    }

    /// Drop kernel caches fleet-wide. Failures are logged and ignored; a host
    /// without sudo rights still runs its case.
    async fn clear_caches(&self, hosts: &[HostSpec]) {
        let cmd = "sync && sudo /sbin/sysctl vm.drop_caches=3";
        let report = self
            .context
            .executor
            .run_blocking(cmd, hosts, self.context.config.timeouts.exec_timeout())
            .await;
        if report.failed_hosts().is_empty() {
            debug!("system caches cleared on all hosts");
        } else {
            warn!(hosts = %report.failed_join(), "cache clearing failed (ignored)");
        }
    }

    /// Merge every collected result log into `result.json` per case and write
    /// the session-wide detail document.
    fn aggregate(
        &self,
        layout: &RunLayout,
        hosts: &[HostSpec],
        reports: &[CaseReport],
    ) -> Result<()> {
        let mut detail_cases = serde_json::Map::new();
        for report in reports {
            let host_dirs: Vec<std::path::PathBuf> = hosts
                .iter()
                .enumerate()
                .map(|(rank, host)| layout.host_dir(&report.case, &host.address, rank))
                .collect();

            let mut merged = MergedResults::new();
            match merged.ingest_host_logs(&host_dirs) {
                Ok(0) => debug!(case = %report.case, "no result entries to merge"),
                Ok(n) => {
                    let path = layout.case_dir(&report.case).join(RESULT_JSON);
                    merged.save(&path, EXPECTED_RESULT_FIELDS)?;
                    info!(case = %report.case, entries = n, path = %path.display(), "results merged");
                }
                Err(e) => {
                    // A malformed log fails its case's aggregation only.
                    warn!(case = %report.case, "result aggregation failed: {}", e);
                }
            }

            detail_cases.insert(
                report.case.clone(),
                json!({
                    "verdict": report.verdict.map(|v| v.as_str()),
                    "attempts": report.attempts,
                    "skipped": report.skipped,
                    "hosts": hosts
                        .iter()
                        .enumerate()
                        .map(|(rank, host)| json!({
                            "address": host.address,
                            "noderank": rank,
                        }))
                        .collect::<Vec<Value>>(),
                }),
            );
        }

        let detail = json!({
            "workload": self.workload.kind(),
            "vendor": self.context.config.vendor,
            "cases": Value::Object(detail_cases),
        });
        let path = layout.root().join(DETAIL_JSON);
        let rendered = serde_json::to_string_pretty(&detail).map_err(RunError::Json)?;
        std::fs::write(&path, rendered).map_err(RunError::Io)?;
        debug!(path = %path.display(), "detail document written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HostOutcome, HostReport};
    use crate::config::Timeouts;
    use crate::markers::touch_marker;
    use crate::testing::{MockClock, ScriptedCluster};
    use indexmap::IndexMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config(hosts: &[&str], max_retries: u32) -> FleetConfig {
        let mut cases = IndexMap::new();
        cases.insert("mm:FP16:4096".to_string(), "pytorch".to_string());
        FleetConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ssh_port: 22,
            ssh_user: None,
            ssh_key: None,
            vendor: "nvidia".to_string(),
            deploy_path: PathBuf::from("/opt/fleetbench"),
            log_path: PathBuf::from("logs"),
            log_level: "info".to_string(),
            cases,
            nproc_per_node: 1,
            clear_caches: false,
            extra_args: Vec::new(),
            container: Default::default(),
            timeouts: Timeouts {
                poll_interval_secs: 5,
                global_ceiling_secs: 600,
                interruption_threshold_secs: 3600,
                dispatch_grace_secs: 1,
                ..Timeouts::default()
            },
            max_retries,
        }
    }

    /// Liveness probes report the process dead; everything else succeeds.
    fn dead_task_cluster() -> ScriptedCluster {
        ScriptedCluster::with_blocking(|cmd, hosts| {
            let mut report = HostReport::new();
            for host in hosts {
                if cmd.contains("kill -0") {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Failed {
                            reason: "no such process".to_string(),
                        },
                    );
                } else {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Success {
                            stdout: String::new(),
                        },
                    );
                }
            }
            report
        })
    }

    fn pipeline(config: FleetConfig, cluster: Arc<ScriptedCluster>) -> Pipeline {
        Pipeline::new(
            OrchestratorContext {
                config,
                executor: cluster,
                clock: Arc::new(MockClock::default()),
            },
            Box::new(OperationWorkload),
        )
    }

    #[test]
    fn test_container_name_is_case_unique_and_sanitized() {
        let name = container_name("fleetbench-operation-nvidia-pytorch:latest", "mm:FP16:4096");
        assert_eq!(
            name,
            "fleetbench-operation-nvidia-pytorch-latest-mm-FP16-4096-container"
        );
        let other = container_name("fleetbench-operation-nvidia-pytorch:latest", "mm:FP32:4096");
        assert_ne!(name, other);
    }

    #[tokio::test]
    async fn test_preflight_fails_on_unreachable_host() {
        let cluster = Arc::new(ScriptedCluster::all_failure());
        let p = pipeline(test_config(&["h1", "h2"], 0), cluster);
        let err = p.preflight().await.unwrap_err();
        assert!(err.to_string().contains("Unreachable hosts"));
    }

    #[tokio::test]
    async fn test_preflight_fails_on_missing_deploy_path() {
        let cluster = Arc::new(ScriptedCluster::failing_on("test -d"));
        let p = pipeline(test_config(&["h1"], 0), cluster);
        let err = p.preflight().await.unwrap_err();
        assert!(err.to_string().contains("Deploy path"));
    }

    #[tokio::test]
    async fn test_session_success_with_completion_marker() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        // The rank-0 host wrote its completion marker before the task died.
        let markers = MarkerSet::new(layout.host_dir("mm:FP16:4096", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.completed_path()).unwrap();

        let cluster = Arc::new(dead_task_cluster());
        let p = pipeline(test_config(&["h1", "h2"], 2), cluster.clone());
        let session = p.run_in(&layout).await.unwrap();

        assert!(session.all_cases_succeeded());
        assert_eq!(session.cases[0].attempts, 0);
        assert!(session.collected_all);
        // Exactly one dispatch, and the log tree of the case was pulled.
        assert_eq!(cluster.detached_commands().len(), 1);
        assert_eq!(cluster.collected_trees().len(), 1);
        // The resolved config was snapshotted locally and pushed out.
        assert!(layout.root().join("fleet_config.yaml").exists());
        assert_eq!(cluster.synced_files().len(), 1);
        // Container was prepared and torn down.
        let cmds = cluster.blocking_commands();
        assert!(cmds.iter().any(|c| c.contains("docker run")));
        assert!(cmds.iter().any(|c| c.contains("docker stop -t")));
    }

    #[tokio::test]
    async fn test_preflight_checks_each_host_exactly_once() {
        let cluster = Arc::new(ScriptedCluster::all_success());
        let p = pipeline(test_config(&["h1", "h2"], 0), cluster.clone());
        p.preflight().await.unwrap();
        assert_eq!(cluster.healthcheck_count(), 1);
        assert!(cluster.blocking_commands()[0].contains("test -d /opt/fleetbench"));
    }

    #[tokio::test]
    async fn test_monitors_bracket_the_container_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        let markers = MarkerSet::new(layout.host_dir("mm:FP16:4096", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.completed_path()).unwrap();

        let cluster = Arc::new(dead_task_cluster());
        let p = pipeline(test_config(&["h1"], 2), cluster.clone());
        p.run_in(&layout).await.unwrap();

        let cmds = cluster.blocking_commands();
        let idx = |needle: &str| cmds.iter().position(|c| c.contains(needle)).unwrap();
        // Both monitors restart after the container is up, logging into the
        // case directory.
        assert!(idx("sys_monitor.py -o restart") > idx("docker run"));
        assert!(cmds[idx("sys_monitor.py -o restart")].contains("mm:FP16:4096"));
        assert!(cmds
            .iter()
            .any(|c| c.contains("vendors/nvidia/nvidia_monitor.py -o restart")));
        // Both stop after teardown.
        assert!(idx("sys_monitor.py -o stop") > idx("docker stop -t"));
        assert!(cmds.iter().any(|c| c.contains("nvidia_monitor.py -o stop")));
    }

    #[tokio::test]
    async fn test_monitor_failures_never_fail_the_case() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        let markers = MarkerSet::new(layout.host_dir("mm:FP16:4096", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.completed_path()).unwrap();

        let cluster = Arc::new(ScriptedCluster::with_blocking(|cmd, hosts| {
            let mut report = HostReport::new();
            for host in hosts {
                let failed = cmd.contains("_monitor.py")
                    || cmd.contains("sys_monitor.py")
                    || cmd.contains("kill -0");
                if failed {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Failed {
                            reason: "scripted".to_string(),
                        },
                    );
                } else {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Success {
                            stdout: String::new(),
                        },
                    );
                }
            }
            report
        }));
        let p = pipeline(test_config(&["h1"], 0), cluster);
        let session = p.run_in(&layout).await.unwrap();
        assert!(session.all_cases_succeeded());
    }

    #[tokio::test]
    async fn test_unreadable_marker_state_aborts_case_after_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        // A file where the rank-0 host directory should be makes every
        // marker read fail with NotADirectory.
        let host_dir = layout.host_dir("mm:FP16:4096", "h1", 0);
        std::fs::create_dir_all(host_dir.parent().unwrap()).unwrap();
        std::fs::write(&host_dir, b"in the way").unwrap();
        // The second case is healthy and must still run.
        let markers = MarkerSet::new(layout.host_dir("conv:FP32:256", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.completed_path()).unwrap();

        let cluster = Arc::new(dead_task_cluster());
        let mut config = test_config(&["h1"], 2);
        config
            .cases
            .insert("conv:FP32:256".to_string(), "pytorch".to_string());
        let p = pipeline(config, cluster.clone());
        let session = p.run_in(&layout).await.unwrap();

        assert_eq!(session.cases[0].verdict, Some(RunVerdict::Aborted));
        assert_eq!(session.cases[1].verdict, Some(RunVerdict::Success));
        // Both cases were torn down despite the marker read failure.
        assert_eq!(
            cluster
                .blocking_commands()
                .iter()
                .filter(|c| c.contains("docker stop -t"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_session_aborts_case_without_markers() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));

        let cluster = Arc::new(dead_task_cluster());
        let p = pipeline(test_config(&["h1"], 2), cluster);
        let session = p.run_in(&layout).await.unwrap();

        assert_eq!(session.cases[0].verdict, Some(RunVerdict::Aborted));
        assert!(!session.all_cases_succeeded());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_dispatches_exactly_max_retries_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        // A fresh start marker with no completion marker classifies every
        // attempt as an interruption.
        let markers = MarkerSet::new(layout.host_dir("mm:FP16:4096", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.started_path()).unwrap();

        let cluster = Arc::new(dead_task_cluster());
        let p = pipeline(test_config(&["h1"], 2), cluster.clone());
        let session = p.run_in(&layout).await.unwrap();

        // Initial dispatch plus two re-dispatches, then a timeout verdict.
        assert_eq!(cluster.detached_commands().len(), 3);
        assert_eq!(session.cases[0].verdict, Some(RunVerdict::TimedOut));
        assert_eq!(session.cases[0].attempts, 2);

        // Each re-dispatch used a fresh PID path and repeats only the
        // interrupted phase.
        let dispatched = cluster.detached_commands();
        assert!(dispatched[0].contains("start_task_mm_FP16_4096.pid"));
        assert!(!dispatched[0].contains("--retry_performance_only"));
        assert!(dispatched[1].contains("_retry1.pid"));
        assert!(dispatched[1].contains("--retry_performance_only"));
        assert!(dispatched[2].contains("_retry2.pid"));
        assert!(dispatched[2].contains("--retry_performance_only"));
    }

    #[tokio::test]
    async fn test_ceiling_abort_still_tears_down_every_host() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        // Completion marker present; the ceiling must still win.
        let markers = MarkerSet::new(layout.host_dir("mm:FP16:4096", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.completed_path()).unwrap();

        let clock = Arc::new(MockClock::default());
        let t0 = clock.now();
        let liveness_clock = clock.clone();
        // H1 and H2 report the process dead after 5s; H3 never does.
        let cluster = Arc::new(ScriptedCluster::with_blocking(move |cmd, hosts| {
            let elapsed = liveness_clock.now().duration_since(t0).unwrap_or_default();
            let mut report = HostReport::new();
            for host in hosts {
                let dead = cmd.contains("kill -0")
                    && host.address != "h3"
                    && elapsed >= Duration::from_secs(5);
                if dead {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Failed {
                            reason: "no such process".to_string(),
                        },
                    );
                } else {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Success {
                            stdout: String::new(),
                        },
                    );
                }
            }
            report
        }));

        let mut config = test_config(&["h1", "h2", "h3"], 2);
        config.timeouts.global_ceiling_secs = 60;
        config.timeouts.dispatch_grace_secs = 0;
        let p = Pipeline::new(
            OrchestratorContext {
                config,
                executor: cluster.clone(),
                clock,
            },
            Box::new(OperationWorkload),
        );
        let session = p.run_in(&layout).await.unwrap();

        assert_eq!(session.cases[0].verdict, Some(RunVerdict::Aborted));
        // Teardown still runs over the whole fleet after the forced abort.
        assert!(cluster
            .blocking_commands()
            .iter()
            .any(|c| c.contains("docker stop -t")));
    }

    #[tokio::test]
    async fn test_prepare_failure_skips_case_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));

        let cluster = Arc::new(ScriptedCluster::failing_on("docker run"));
        let p = pipeline(test_config(&["h1"], 2), cluster.clone());
        let session = p.run_in(&layout).await.unwrap();

        assert!(session.cases[0].verdict.is_none());
        assert!(session.cases[0].skipped.as_deref().unwrap().contains("prepare"));
        assert!(cluster.detached_commands().is_empty());
    }

    #[tokio::test]
    async fn test_aggregation_writes_merged_results() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        let markers = MarkerSet::new(layout.host_dir("mm:FP16:4096", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.completed_path()).unwrap();

        // Both hosts left a result log behind; h2's entry wins the shared
        // latency field.
        let line = |latency: f64| {
            format!(
                "[INFO] {}",
                serde_json::json!({
                    "op_name": "mm",
                    "dtype": "FP16",
                    "result": [{"shape_detail": "4096x4096", "latency": latency}]
                })
            )
        };
        let h1 = layout.host_dir("mm:FP16:4096", "h1", 0);
        let h2 = layout.host_dir("mm:FP16:4096", "h2", 1);
        std::fs::create_dir_all(&h2).unwrap();
        std::fs::write(h1.join(crate::layout::RESULT_LOG), line(1.5)).unwrap();
        std::fs::write(h2.join(crate::layout::RESULT_LOG), line(1.2)).unwrap();

        let cluster = Arc::new(dead_task_cluster());
        let p = pipeline(test_config(&["h1", "h2"], 0), cluster);
        let session = p.run_in(&layout).await.unwrap();
        assert!(session.all_cases_succeeded());

        let result_path = layout.case_dir("mm:FP16:4096").join(RESULT_JSON);
        let doc: Value =
            serde_json::from_str(&std::fs::read_to_string(result_path).unwrap()).unwrap();
        let entry = &doc["mm_FP16_4096x4096"];
        assert_eq!(entry["latency"], serde_json::json!(1.2));
        assert_eq!(entry["ratio"], serde_json::json!("N/A"));

        let detail_path = layout.root().join(DETAIL_JSON);
        let detail: Value =
            serde_json::from_str(&std::fs::read_to_string(detail_path).unwrap()).unwrap();
        assert_eq!(detail["cases"]["mm:FP16:4096"]["verdict"], "success");
        assert_eq!(
            detail["cases"]["mm:FP16:4096"]["hosts"][1]["noderank"],
            serde_json::json!(1)
        );
    }

    #[tokio::test]
    async fn test_clear_caches_failures_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::at(dir.path().join("run1"));
        let markers = MarkerSet::new(layout.host_dir("mm:FP16:4096", "h1", 0), PERFORMANCE_PHASE);
        touch_marker(&markers.completed_path()).unwrap();

        let cluster = Arc::new(ScriptedCluster::with_blocking(|cmd, hosts| {
            let mut report = HostReport::new();
            for host in hosts {
                let failed = cmd.contains("drop_caches") || cmd.contains("kill -0");
                if failed {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Failed {
                            reason: "scripted".to_string(),
                        },
                    );
                } else {
                    report.insert(
                        host.address.clone(),
                        HostOutcome::Success {
                            stdout: String::new(),
                        },
                    );
                }
            }
            report
        }));

        let mut config = test_config(&["h1"], 0);
        config.clear_caches = true;
        let p = pipeline(config, cluster.clone());
        let session = p.run_in(&layout).await.unwrap();

        assert!(session.all_cases_succeeded());
        assert!(cluster
            .blocking_commands()
            .iter()
            .any(|c| c.contains("vm.drop_caches=3")));
    }
}
