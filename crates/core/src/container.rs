//! Container lifecycle management across the fleet
//!
//! Prepares one container per host for a case (stop any leftover, start
//! fresh, verify with a liveness probe) and tears it down afterwards with an
//! escalation ladder: graceful stop, forced removal, best-effort prune.
//! Teardown never raises; it must complete for every host regardless of
//! individual failures.
//!
//! All host interaction goes through the cluster executor; the docker
//! invocations themselves are assembled here with structured quoting.

use crate::cluster::{ClusterExecutor, HostSpec};
use crate::config::Timeouts;
use crate::errors::{ContainerError, Result};
use shell_words::quote;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Placeholder substituted with the container name in launch templates
pub const CONTAINER_NAME_PLACEHOLDER: &str = "{CONTAINER_NAME}";

/// Structured container launch description
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference (repository:tag)
    pub image: String,
    /// Working directory inside the container
    pub workdir: PathBuf,
    /// Bind mounts, (host path, container path)
    pub mounts: Vec<(PathBuf, PathBuf)>,
    /// Shared-memory size (`--shm-size`)
    pub shm_size: String,
    /// Extra runtime options appended verbatim (accelerator flags etc.)
    pub extra_opts: Vec<String>,
}

/// How to launch the container: assembled from a structured spec or taken
/// from a caller-supplied full template with name substitution
#[derive(Debug, Clone)]
pub enum LaunchPlan {
    Spec(ContainerSpec),
    Template(String),
}

/// Fleet-wide container lifecycle manager
pub struct ContainerManager {
    executor: Arc<dyn ClusterExecutor>,
    timeouts: Timeouts,
}

impl ContainerManager {
    pub fn new(executor: Arc<dyn ClusterExecutor>, timeouts: Timeouts) -> Self {
        Self { executor, timeouts }
    }

    /// Assemble the `docker run` command for a launch plan
    ///
    /// Template plans substitute `{CONTAINER_NAME}`; a template without the
    /// placeholder and without an explicit `--name` gets `--name=<name>`
    /// injected before the image argument.
    pub fn launch_command(&self, name: &str, plan: &LaunchPlan) -> Result<String> {
        match plan {
            LaunchPlan::Spec(spec) => {
                let mut args: Vec<String> = vec![
                    "docker".into(),
                    "run".into(),
                    "--rm".into(),
                    "--init".into(),
                    "--detach".into(),
                    "--net=host".into(),
                    "--uts=host".into(),
                    "--ipc=host".into(),
                    "--security-opt=seccomp=unconfined".into(),
                    "--privileged=true".into(),
                    "--ulimit=stack=67108864".into(),
                    "--ulimit=memlock=-1".into(),
                    format!("--shm-size={}", spec.shm_size),
                    "-w".into(),
                    spec.workdir.display().to_string(),
                ];
                for (host_path, container_path) in &spec.mounts {
                    args.push("-v".into());
                    args.push(format!(
                        "{}:{}",
                        host_path.display(),
                        container_path.display()
                    ));
                }
                args.extend(spec.extra_opts.iter().cloned());
                args.push(format!("--name={}", name));
                args.push(spec.image.clone());
                // Keep the container alive for subsequent execs.
                args.push("sleep".into());
                args.push("infinity".into());
                Ok(shell_words::join(args.iter().map(|s| s.as_str())))
            }
            LaunchPlan::Template(template) => {
                if template.contains(CONTAINER_NAME_PLACEHOLDER) {
                    return Ok(template.replace(CONTAINER_NAME_PLACEHOLDER, name));
                }
                if template.contains("--name") {
                    return Ok(template.clone());
                }
                // Inject --name before the image: the first token after
                // `docker run` that is not an option or an option value.
                let tokens =
                    shell_words::split(template).map_err(|e| ContainerError::InvalidTemplate {
                        message: e.to_string(),
                    })?;
                if tokens.len() < 2 {
                    return Err(ContainerError::InvalidTemplate {
                        message: format!("template too short: {}", template),
                    }
                    .into());
                }
                let mut insert_pos = tokens.len();
                for (i, token) in tokens.iter().enumerate().skip(2) {
                    if !token.starts_with('-') {
                        insert_pos = i;
                        break;
                    }
                }
                let mut tokens = tokens;
                tokens.insert(insert_pos, format!("--name={}", name));
                // Plain rejoin; shell_words::join would re-quote the `=` in
                // the injected flag.
                Ok(tokens.join(" "))
            }
        }
    }

    /// Prepare the container on every host: stop leftovers (ignoring "not
    /// found"), start fresh, probe liveness. Returns true only when every
    /// host is ready; on any failure all hosts are rolled back to a cleaned
    /// state and false is returned.
    pub async fn prepare(&self, hosts: &[HostSpec], name: &str, plan: &LaunchPlan) -> Result<bool> {
        debug!(container = name, hosts = hosts.len(), "prepare containers");

        // a) Stop old containers first. "No such container" is expected and
        // the report is only logged.
        let stop_cmd = format!("docker stop {} >/dev/null 2>&1 || true", quote(name));
        let report = self
            .executor
            .run_blocking(&stop_cmd, hosts, self.timeouts.stop_timeout())
            .await;
        if !report.failed_hosts().is_empty() {
            debug!(
                hosts = %report.failed_join(),
                "pre-start stop reported failures (ignored)"
            );
        }

        // b) Start fresh containers.
        let start_cmd = self.launch_command(name, plan)?;
        let report = self
            .executor
            .run_blocking(&start_cmd, hosts, self.timeouts.prepare_timeout())
            .await;
        if !report.all_succeeded() {
            warn!(
                container = name,
                hosts = %report.failed_join(),
                "container start failed"
            );
            self.teardown(hosts, name).await;
            return Ok(false);
        }

        // c) Verify via a liveness probe executed inside the container.
        let probe_cmd = format!("docker exec {} true", quote(name));
        let report = self
            .executor
            .run_blocking(&probe_cmd, hosts, self.timeouts.exec_timeout())
            .await;
        if !report.all_succeeded() {
            warn!(
                container = name,
                hosts = %report.failed_join(),
                "container liveness probe failed"
            );
            self.teardown(hosts, name).await;
            return Ok(false);
        }

        info!(container = name, "containers ready on all hosts");
        Ok(true)
    }

    /// Tear the container down on every host, escalating from graceful stop
    /// to forced removal to a best-effort prune. Each escalation step is
    /// logged but never raises; calling this on an already-removed container
    /// completes for all hosts.
    pub async fn teardown(&self, hosts: &[HostSpec], name: &str) {
        debug!(container = name, hosts = hosts.len(), "teardown containers");

        let stop_cmd = format!(
            "docker stop -t {} {}",
            self.timeouts.stop_timeout().as_secs(),
            quote(name)
        );
        let report = self
            .executor
            .run_blocking(&stop_cmd, hosts, self.timeouts.stop_timeout() * 2)
            .await;
        let stop_failed = report.failed_hosts();
        if stop_failed.is_empty() {
            return;
        }
        warn!(
            container = name,
            hosts = %report.failed_join(),
            "graceful stop failed, escalating to forced removal"
        );

        let failed_specs: Vec<HostSpec> = hosts
            .iter()
            .filter(|h| stop_failed.contains(&h.address))
            .cloned()
            .collect();

        let rm_cmd = format!("docker rm -f {}", quote(name));
        let report = self
            .executor
            .run_blocking(&rm_cmd, &failed_specs, self.timeouts.stop_timeout())
            .await;
        let rm_failed = report.failed_hosts();
        if rm_failed.is_empty() {
            return;
        }
        warn!(
            container = name,
            hosts = %report.failed_join(),
            "forced removal failed, pruning stopped containers"
        );

        let prune_specs: Vec<HostSpec> = hosts
            .iter()
            .filter(|h| rm_failed.contains(&h.address))
            .cloned()
            .collect();
        let prune_cmd = "docker container prune -f".to_string();
        let report = self
            .executor
            .run_blocking(&prune_cmd, &prune_specs, self.timeouts.stop_timeout())
            .await;
        if !report.failed_hosts().is_empty() {
            warn!(
                container = name,
                hosts = %report.failed_join(),
                "container prune failed; leaving hosts as-is"
            );
        }
    }
}
