//! Detached task launching
//!
//! Composes the in-container invocation for a run attempt (optional
//! dependency install, optional environment setup, then the entrypoint) and
//! dispatches it fire-and-forget through the cluster executor. The remote
//! wrapper records its own process id to the attempt's PID-file path
//! immediately on start; the entrypoint is responsible for dropping phase
//! markers as it progresses. Dispatch returns once the launch is confirmed,
//! never waiting for task completion.

use crate::cluster::{ClusterExecutor, HostReport, HostSpec};
use crate::layout::TASK_LOG;
use crate::run::Run;
use shell_words::quote;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// In-container task description for one case
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Entrypoint program and arguments, unquoted
    pub entrypoint: Vec<String>,
    /// Requirements file installed before the entrypoint runs
    pub requirements: Option<PathBuf>,
    /// Environment script sourced before the entrypoint runs
    pub env_script: Option<PathBuf>,
    /// Host log directory for this case's setup and task output
    pub log_dir: PathBuf,
}

/// Dispatches run attempts into their containers
pub struct TaskLauncher {
    executor: Arc<dyn ClusterExecutor>,
    dispatch_timeout: Duration,
}

impl TaskLauncher {
    pub fn new(executor: Arc<dyn ClusterExecutor>, dispatch_timeout: Duration) -> Self {
        Self {
            executor,
            dispatch_timeout,
        }
    }

    /// Build the full host-side command for one attempt
    ///
    /// The inner script writes its own PID first, so a liveness probe started
    /// during setup already observes the right process; `exec` hands the same
    /// PID to the entrypoint.
    pub fn build_command(&self, run: &Run, spec: &TaskSpec) -> String {
        let pid = quote(&run.pid_path.display().to_string()).into_owned();
        let log_dir = run_dir(&spec.log_dir);

        let mut steps = vec![format!("echo $$ > {}", pid)];
        if let Some(requirements) = &spec.requirements {
            steps.push(format!(
                "pip install -r {} > {}/pip_install.log.txt 2>&1",
                quote(&requirements.display().to_string()),
                log_dir
            ));
        }
        if let Some(env_script) = &spec.env_script {
            steps.push(format!(
                "source {} > {}/env.log.txt 2>&1",
                quote(&env_script.display().to_string()),
                log_dir
            ));
        }
        steps.push(format!(
            "exec {} > {}/{} 2>&1",
            shell_words::join(spec.entrypoint.iter().map(|s| s.as_str())),
            log_dir,
            TASK_LOG
        ));

        let inner = steps.join(" && ");
        format!(
            "docker exec {} bash -c {}",
            quote(&run.container),
            quote(&inner)
        )
    }

    /// Dispatch one attempt to the targeted hosts. Returns after dispatch
    /// confirmation with the per-host report; failed dispatches are the
    /// caller's to judge.
    pub async fn dispatch(&self, run: &Run, spec: &TaskSpec, hosts: &[HostSpec]) -> HostReport {
        let cmd = self.build_command(run, spec);
        debug!(case = %run.case, attempt = run.attempt, cmd = %cmd, "dispatching task");
        let report = self
            .executor
            .run_detached(&cmd, hosts, self.dispatch_timeout)
            .await;
        info!(
            case = %run.case,
            attempt = run.attempt,
            dispatched = report.succeeded_hosts().len(),
            failed = report.failed_hosts().len(),
            "task dispatch confirmed"
        );
        report
    }
}

fn run_dir(dir: &std::path::Path) -> String {
    quote(&dir.display().to_string()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RunLayout;
    use crate::testing::ScriptedCluster;

    fn spec() -> TaskSpec {
        TaskSpec {
            entrypoint: vec![
                "python3".to_string(),
                "/workspace/container_main.py".to_string(),
                "--case_name".to_string(),
                "mm:FP16:4096".to_string(),
            ],
            requirements: Some(PathBuf::from("/workspace/benchmarks/mm/requirements.txt")),
            env_script: Some(PathBuf::from("/workspace/benchmarks/mm/env.sh")),
            log_dir: PathBuf::from("/opt/fb/logs/run1"),
        }
    }

    fn launcher(cluster: Arc<ScriptedCluster>) -> TaskLauncher {
        TaskLauncher::new(cluster, Duration::from_secs(180))
    }

    #[test]
    fn test_build_command_records_pid_first() {
        let cluster = Arc::new(ScriptedCluster::all_success());
        let layout = RunLayout::at(PathBuf::from("/opt/fb/logs/run1"));
        let run = Run::new("mm:FP16:4096", "bench-c", &layout);
        let cmd = launcher(cluster).build_command(&run, &spec());

        assert!(cmd.starts_with("docker exec bench-c bash -c "));
        let pid_write = cmd.find("echo $$ >").unwrap();
        let pip = cmd.find("pip install -r").unwrap();
        let source = cmd.find("source").unwrap();
        let entry = cmd.find("exec python3").unwrap();
        assert!(pid_write < pip && pip < source && source < entry);
        assert!(cmd.contains("start_task_mm_FP16_4096.pid"));
        assert!(cmd.contains("pip_install.log.txt"));
        assert!(cmd.contains("task.log.txt"));
    }

    #[test]
    fn test_build_command_without_setup_steps() {
        let cluster = Arc::new(ScriptedCluster::all_success());
        let layout = RunLayout::at(PathBuf::from("/opt/fb/logs/run1"));
        let run = Run::new("mm:FP16:4096", "bench-c", &layout);
        let mut task = spec();
        task.requirements = None;
        task.env_script = None;
        let cmd = launcher(cluster).build_command(&run, &task);
        assert!(!cmd.contains("pip install"));
        assert!(!cmd.contains("source"));
        assert!(cmd.contains("exec python3"));
    }

    #[test]
    fn test_build_command_uses_attempt_pid_path() {
        let cluster = Arc::new(ScriptedCluster::all_success());
        let layout = RunLayout::at(PathBuf::from("/opt/fb/logs/run1"));
        let mut run = Run::new("mm:FP16:4096", "bench-c", &layout);
        run.next_attempt(&layout);
        let cmd = launcher(cluster).build_command(&run, &spec());
        assert!(cmd.contains("start_task_mm_FP16_4096_retry1.pid"));
    }

    #[tokio::test]
    async fn test_dispatch_goes_through_detached_channel() {
        let cluster = Arc::new(ScriptedCluster::all_success());
        let layout = RunLayout::at(PathBuf::from("/opt/fb/logs/run1"));
        let run = Run::new("mm:FP16:4096", "bench-c", &layout);
        let hosts = ScriptedCluster::hosts(&["h1", "h2"]);

        let report = launcher(cluster.clone()).dispatch(&run, &spec(), &hosts).await;
        assert!(report.all_succeeded());
        assert!(cluster.blocking_commands().is_empty());
        let detached = cluster.detached_commands();
        assert_eq!(detached.len(), 1);
        assert!(detached[0].contains("docker exec bench-c"));
    }
}
