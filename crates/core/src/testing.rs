//! Shared test doubles: a scripted cluster executor, a mock clock, and a
//! fake marker view. Compiled only for tests.

use crate::cluster::{ClusterExecutor, HostOutcome, HostReport, HostSpec};
use crate::markers::{MarkerStatus, MarkerView};
use crate::poller::Clock;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

type BlockingFn = dyn Fn(&str, &[HostSpec]) -> HostReport + Send + Sync;

/// Records every executor call and answers according to a scripted behavior
pub struct ScriptedCluster {
    blocking: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
    collected: Mutex<Vec<(PathBuf, PathBuf)>>,
    synced: Mutex<Vec<PathBuf>>,
    healthchecks: Mutex<u32>,
    on_blocking: Box<BlockingFn>,
    on_detached: Box<BlockingFn>,
    collect_ok: bool,
}

fn success_report(hosts: &[HostSpec]) -> HostReport {
    let mut report = HostReport::new();
    for host in hosts {
        report.insert(
            host.address.clone(),
            HostOutcome::Success {
                stdout: String::new(),
            },
        );
    }
    report
}

fn failure_report(hosts: &[HostSpec], reason: &str) -> HostReport {
    let mut report = HostReport::new();
    for host in hosts {
        report.insert(
            host.address.clone(),
            HostOutcome::Failed {
                reason: reason.to_string(),
            },
        );
    }
    report
}

impl ScriptedCluster {
    fn build(on_blocking: Box<BlockingFn>, on_detached: Box<BlockingFn>) -> Self {
        Self {
            blocking: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            collected: Mutex::new(Vec::new()),
            synced: Mutex::new(Vec::new()),
            healthchecks: Mutex::new(0),
            on_blocking,
            on_detached,
            collect_ok: true,
        }
    }

    /// Every operation succeeds on every host
    pub fn all_success() -> Self {
        Self::build(
            Box::new(|_, hosts| success_report(hosts)),
            Box::new(|_, hosts| success_report(hosts)),
        )
    }

    /// Every operation fails on every host, collection included
    pub fn all_failure() -> Self {
        let mut cluster = Self::build(
            Box::new(|_, hosts| failure_report(hosts, "scripted failure")),
            Box::new(|_, hosts| failure_report(hosts, "scripted failure")),
        );
        cluster.collect_ok = false;
        cluster
    }

    /// Blocking commands containing `needle` fail; everything else succeeds
    pub fn failing_on(needle: &'static str) -> Self {
        Self::build(
            Box::new(move |cmd, hosts| {
                if cmd.contains(needle) {
                    failure_report(hosts, "scripted failure")
                } else {
                    success_report(hosts)
                }
            }),
            Box::new(|_, hosts| success_report(hosts)),
        )
    }

    /// Custom behavior for blocking commands; everything else succeeds
    pub fn with_blocking<F>(f: F) -> Self
    where
        F: Fn(&str, &[HostSpec]) -> HostReport + Send + Sync + 'static,
    {
        Self::build(Box::new(f), Box::new(|_, hosts| success_report(hosts)))
    }

    /// Convenience host list builder
    pub fn hosts(addresses: &[&str]) -> Vec<HostSpec> {
        addresses.iter().map(|a| HostSpec::new(*a)).collect()
    }

    pub fn blocking_commands(&self) -> Vec<String> {
        self.blocking.lock().unwrap().clone()
    }

    pub fn detached_commands(&self) -> Vec<String> {
        self.detached.lock().unwrap().clone()
    }

    pub fn synced_files(&self) -> Vec<PathBuf> {
        self.synced.lock().unwrap().clone()
    }

    pub fn collected_trees(&self) -> Vec<(PathBuf, PathBuf)> {
        self.collected.lock().unwrap().clone()
    }

    pub fn healthcheck_count(&self) -> u32 {
        *self.healthchecks.lock().unwrap()
    }
}

#[async_trait]
impl ClusterExecutor for ScriptedCluster {
    async fn healthcheck(&self, hosts: &[HostSpec]) -> HostReport {
        *self.healthchecks.lock().unwrap() += 1;
        (self.on_blocking)("true", hosts)
    }

    async fn run_blocking(&self, cmd: &str, hosts: &[HostSpec], _timeout: Duration) -> HostReport {
        self.blocking.lock().unwrap().push(cmd.to_string());
        (self.on_blocking)(cmd, hosts)
    }

    async fn run_detached(
        &self,
        cmd: &str,
        hosts: &[HostSpec],
        _dispatch_timeout: Duration,
    ) -> HostReport {
        self.detached.lock().unwrap().push(cmd.to_string());
        (self.on_detached)(cmd, hosts)
    }

    async fn sync_file(
        &self,
        local_path: &Path,
        _remote_dir: &Path,
        hosts: &[HostSpec],
    ) -> HostReport {
        self.synced.lock().unwrap().push(local_path.to_path_buf());
        success_report(hosts)
    }

    async fn collect_tree(
        &self,
        remote_dir: &Path,
        local_dir: &Path,
        hosts: &[HostSpec],
        _timeout: Duration,
    ) -> HostReport {
        self.collected
            .lock()
            .unwrap()
            .push((remote_dir.to_path_buf(), local_dir.to_path_buf()));
        if self.collect_ok {
            success_report(hosts)
        } else {
            failure_report(hosts, "scripted collect failure")
        }
    }
}

/// Deterministic clock: `sleep` advances `now` without waiting
pub struct MockClock {
    now: Mutex<SystemTime>,
    slept: Mutex<Duration>,
}

impl MockClock {
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    pub fn slept_total(&self) -> Duration {
        *self.slept.lock().unwrap()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::starting_at(SystemTime::now())
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
        *self.slept.lock().unwrap() += duration;
    }
}

/// Marker view answering from a mutable in-memory status
pub struct FakeMarkers {
    status: Mutex<MarkerStatus>,
}

impl FakeMarkers {
    pub fn new(status: MarkerStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    pub fn set(&self, status: MarkerStatus) {
        *self.status.lock().unwrap() = status;
    }
}

impl MarkerView for FakeMarkers {
    fn status(&self) -> std::io::Result<MarkerStatus> {
        Ok(*self.status.lock().unwrap())
    }
}
