//! Fan-out command execution across the fleet
//!
//! This module provides the cluster executor abstraction: running one command
//! concurrently on N hosts with per-host timeouts and isolated per-host
//! failure reporting. The production implementation shells out to `ssh`/`scp`
//! through `tokio::process`; the trait seam exists so the pipeline and poller
//! can be driven by a scripted executor in tests.
//!
//! Every operation is a synchronous barrier: the call returns once every
//! per-host worker has finished or been forcibly terminated on timeout. A
//! worker's failure is recorded against that host only and never aborts
//! sibling workers.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A reachable unit of the fleet. Identity is the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostSpec {
    /// Hostname or IP
    pub address: String,
    /// SSH port
    pub port: u16,
    /// SSH user; defaults to the invoking user when absent
    pub user: Option<String>,
    /// SSH identity file
    pub identity_file: Option<PathBuf>,
}

impl HostSpec {
    /// Convenience constructor for a bare address with defaults
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: 22,
            user: None,
            identity_file: None,
        }
    }

    /// `user@address` destination as understood by ssh/scp
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }
}

/// Outcome of one host's worker within a fan-out call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    /// Zero exit status within the timeout
    Success { stdout: String },
    /// Non-zero exit, timeout, connection drop, or spawn failure
    Failed { reason: String },
}

impl HostOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HostOutcome::Success { .. })
    }
}

/// Per-host outcomes of one fan-out call, keyed by host address
///
/// Owned solely by the call that produced it; consumed immediately by the
/// caller. The map is ordered by address for deterministic reporting.
#[derive(Debug, Clone, Default)]
pub struct HostReport {
    outcomes: BTreeMap<String, HostOutcome>,
}

impl HostReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: impl Into<String>, outcome: HostOutcome) {
        self.outcomes.insert(address.into(), outcome);
    }

    pub fn get(&self, address: &str) -> Option<&HostOutcome> {
        self.outcomes.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HostOutcome)> {
        self.outcomes.iter()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Hosts whose worker failed, in address order
    pub fn failed_hosts(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Hosts whose worker succeeded, in address order
    pub fn succeeded_hosts(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_success())
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(|o| o.is_success())
    }

    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(|o| !o.is_success())
    }

    /// Comma-joined failed host list for log and error messages
    pub fn failed_join(&self) -> String {
        self.failed_hosts().join(",")
    }
}

/// Cluster executor abstraction
///
/// All operations are safe to call repeatedly and must not leak worker
/// processes on timeout.
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    /// Probe reachability of every host. Failed entries in the report are the
    /// unreachable hosts; any non-empty failure set is fatal for the session.
    async fn healthcheck(&self, hosts: &[HostSpec]) -> HostReport;

    /// Execute `cmd` on each host in parallel, one worker per host, each
    /// bounded independently by `timeout`. Returns only once every worker has
    /// finished or been forcibly terminated.
    async fn run_blocking(&self, cmd: &str, hosts: &[HostSpec], timeout: Duration) -> HostReport;

    /// Launch `cmd` as a backgrounded process on each host and return once
    /// dispatch is confirmed, not once the remote command finishes.
    async fn run_detached(
        &self,
        cmd: &str,
        hosts: &[HostSpec],
        dispatch_timeout: Duration,
    ) -> HostReport;

    /// Push a local file into `remote_dir` on every host.
    async fn sync_file(
        &self,
        local_path: &Path,
        remote_dir: &Path,
        hosts: &[HostSpec],
    ) -> HostReport;

    /// Pull a directory tree back from every host into `local_dir`. Partial
    /// success is expected and tolerated.
    async fn collect_tree(
        &self,
        remote_dir: &Path,
        local_dir: &Path,
        hosts: &[HostSpec],
        timeout: Duration,
    ) -> HostReport;
}

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(15);
const SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// SSH/SCP-based cluster executor
#[derive(Debug, Clone)]
pub struct SshCluster {
    /// Extra `-o` options applied to every ssh/scp invocation
    options: Vec<String>,
}

impl SshCluster {
    pub fn new() -> Self {
        Self {
            options: vec![
                "BatchMode=yes".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                "ConnectTimeout=10".to_string(),
            ],
        }
    }

    /// Replace the default ssh `-o` options
    pub fn with_options(options: Vec<String>) -> Self {
        Self { options }
    }

    fn common_args(&self, host: &HostSpec, port_flag: &str) -> Vec<String> {
        let mut args = Vec::new();
        for opt in &self.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args.push(port_flag.to_string());
        args.push(host.port.to_string());
        if let Some(identity) = &host.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    /// Run one remote command on one host, bounded by `limit`
    ///
    /// A timed-out worker is forcibly terminated before this returns: the
    /// child is spawned with kill-on-drop, and dropping the wait future on
    /// timeout reaps it.
    async fn exec_host(&self, host: &HostSpec, cmd: &str, limit: Duration) -> HostOutcome {
        let mut command = Command::new("ssh");
        command
            .args(self.common_args(host, "-p"))
            .arg(host.destination())
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return HostOutcome::Failed {
                    reason: format!("failed to spawn ssh: {}", e),
                }
            }
        };

        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    HostOutcome::Success {
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    HostOutcome::Failed {
                        reason: format!(
                            "exit {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        ),
                    }
                }
            }
            Ok(Err(e)) => HostOutcome::Failed {
                reason: format!("ssh I/O error: {}", e),
            },
            Err(_) => HostOutcome::Failed {
                reason: format!("timed out after {}s", limit.as_secs()),
            },
        }
    }

    /// Run one scp transfer for one host, bounded by `limit`
    async fn scp_host(&self, host: &HostSpec, args: Vec<String>, limit: Duration) -> HostOutcome {
        let mut command = Command::new("scp");
        command
            .args(self.common_args(host, "-P"))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return HostOutcome::Failed {
                    reason: format!("failed to spawn scp: {}", e),
                }
            }
        };

        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    HostOutcome::Success {
                        stdout: String::new(),
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    HostOutcome::Failed {
                        reason: format!(
                            "scp exit {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        ),
                    }
                }
            }
            Ok(Err(e)) => HostOutcome::Failed {
                reason: format!("scp I/O error: {}", e),
            },
            Err(_) => HostOutcome::Failed {
                reason: format!("scp timed out after {}s", limit.as_secs()),
            },
        }
    }

    /// Fan a per-host future out over the fleet and gather the report
    async fn fan_out<F, Fut>(&self, hosts: &[HostSpec], f: F) -> HostReport
    where
        F: Fn(SshCluster, HostSpec) -> Fut,
        Fut: std::future::Future<Output = HostOutcome> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for host in hosts {
            let address = host.address.clone();
            let fut = f(self.clone(), host.clone());
            set.spawn(async move { (address, fut.await) });
        }

        let mut report = HostReport::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((address, outcome)) => report.insert(address, outcome),
                Err(e) => {
                    // A panicked worker loses its address association; this
                    // only happens on a bug in the worker body itself.
                    warn!("fan-out worker panicked: {}", e);
                }
            }
        }
        report
    }
}

impl Default for SshCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterExecutor for SshCluster {
    async fn healthcheck(&self, hosts: &[HostSpec]) -> HostReport {
        debug!(hosts = hosts.len(), "cluster healthcheck");
        self.fan_out(hosts, |cluster, host| async move {
            cluster.exec_host(&host, "true", HEALTHCHECK_TIMEOUT).await
        })
        .await
    }

    async fn run_blocking(&self, cmd: &str, hosts: &[HostSpec], timeout: Duration) -> HostReport {
        debug!(cmd, hosts = hosts.len(), timeout_s = timeout.as_secs(), "run_blocking");
        let cmd = cmd.to_string();
        self.fan_out(hosts, move |cluster, host| {
            let cmd = cmd.clone();
            async move { cluster.exec_host(&host, &cmd, timeout).await }
        })
        .await
    }

    async fn run_detached(
        &self,
        cmd: &str,
        hosts: &[HostSpec],
        dispatch_timeout: Duration,
    ) -> HostReport {
        // The remote shell backgrounds the command and exits immediately, so
        // the ssh call confirms dispatch rather than completion.
        let wrapped = format!("nohup sh -c {} >/dev/null 2>&1 &", shell_words::quote(cmd));
        debug!(cmd = %wrapped, hosts = hosts.len(), "run_detached");
        self.fan_out(hosts, move |cluster, host| {
            let wrapped = wrapped.clone();
            async move { cluster.exec_host(&host, &wrapped, dispatch_timeout).await }
        })
        .await
    }

    async fn sync_file(
        &self,
        local_path: &Path,
        remote_dir: &Path,
        hosts: &[HostSpec],
    ) -> HostReport {
        let local = local_path.to_path_buf();
        let remote = remote_dir.to_path_buf();
        self.fan_out(hosts, move |cluster, host| {
            let local = local.clone();
            let remote = remote.clone();
            async move {
                // Ensure the remote directory exists before the transfer.
                let mkdir = format!("mkdir -p {}", shell_words::quote(&remote.display().to_string()));
                if let HostOutcome::Failed { reason } =
                    cluster.exec_host(&host, &mkdir, SYNC_TIMEOUT).await
                {
                    return HostOutcome::Failed { reason };
                }
                let args = vec![
                    local.display().to_string(),
                    format!("{}:{}/", host.destination(), remote.display()),
                ];
                cluster.scp_host(&host, args, SYNC_TIMEOUT).await
            }
        })
        .await
    }

    async fn collect_tree(
        &self,
        remote_dir: &Path,
        local_dir: &Path,
        hosts: &[HostSpec],
        timeout: Duration,
    ) -> HostReport {
        if let Err(e) = std::fs::create_dir_all(local_dir) {
            // Without a local target nothing can be collected from any host.
            let mut report = HostReport::new();
            for host in hosts {
                report.insert(
                    host.address.clone(),
                    HostOutcome::Failed {
                        reason: format!("local dir {}: {}", local_dir.display(), e),
                    },
                );
            }
            return report;
        }

        let remote = remote_dir.to_path_buf();
        let local = local_dir.to_path_buf();
        self.fan_out(hosts, move |cluster, host| {
            let remote = remote.clone();
            let local = local.clone();
            async move {
                let args = vec![
                    "-r".to_string(),
                    format!("{}:{}/.", host.destination(), remote.display()),
                    local.display().to_string(),
                ];
                cluster.scp_host(&host, args, timeout).await
            }
        })
        .await
    }
}
