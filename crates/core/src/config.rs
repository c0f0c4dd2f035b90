//! Fleet configuration loading and validation
//!
//! The fleet config is a YAML document enumerating hosts, per-case
//! parameters, container options, and the retry/timeout thresholds that drive
//! the completion state machine. Missing required fields are a fatal startup
//! error; everything else carries a default.

use crate::cluster::HostSpec;
use crate::errors::{ConfigError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

fn default_ssh_port() -> u16 {
    22
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_nproc_per_node() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_shm_size() -> String {
    "32G".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_global_ceiling_secs() -> u64 {
    // 24 hours; one stuck case must not deadlock the pipeline
    86_400
}

fn default_interruption_threshold_secs() -> u64 {
    // A start marker older than this is a genuine long-running timeout, not
    // an interruption worth retrying. Single threshold; it conflates "slow
    // but healthy" with "hung", and no better signal is available.
    14_400
}

fn default_dispatch_grace_secs() -> u64 {
    60
}

fn default_exec_timeout_secs() -> u64 {
    120
}

fn default_prepare_timeout_secs() -> u64 {
    600
}

fn default_stop_timeout_secs() -> u64 {
    60
}

fn default_collect_timeout_secs() -> u64 {
    600
}

/// Container launch options shared by every case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// Shared-memory size passed to the runtime (`--shm-size`)
    #[serde(default = "default_shm_size")]
    pub shm_size: String,
    /// Extra runtime options appended verbatim (accelerator flags etc.)
    #[serde(default)]
    pub extra_opts: Vec<String>,
    /// Full launch template with a `{CONTAINER_NAME}` placeholder; when set it
    /// replaces the structured launch assembly entirely
    #[serde(default)]
    pub custom_launch: Option<String>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            shm_size: default_shm_size(),
            extra_opts: Vec::new(),
            custom_launch: None,
        }
    }
}

/// Timeout and polling thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Sleep between PID liveness checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Wall-clock ceiling per run attempt; exceeding it forces abort
    #[serde(default = "default_global_ceiling_secs")]
    pub global_ceiling_secs: u64,
    /// Elapsed time since the start marker beyond which an interrupted phase
    /// is classified as a timeout instead of retried
    #[serde(default = "default_interruption_threshold_secs")]
    pub interruption_threshold_secs: u64,
    /// Grace wait after detached dispatch before polling begins
    #[serde(default = "default_dispatch_grace_secs")]
    pub dispatch_grace_secs: u64,
    /// Per-host bound for short remote commands (probes, liveness checks)
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    /// Per-host bound for container prepare steps
    #[serde(default = "default_prepare_timeout_secs")]
    pub prepare_timeout_secs: u64,
    /// Per-host bound for container stop during teardown
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Per-host bound for pulling a log tree back to the controller
    #[serde(default = "default_collect_timeout_secs")]
    pub collect_timeout_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            global_ceiling_secs: default_global_ceiling_secs(),
            interruption_threshold_secs: default_interruption_threshold_secs(),
            dispatch_grace_secs: default_dispatch_grace_secs(),
            exec_timeout_secs: default_exec_timeout_secs(),
            prepare_timeout_secs: default_prepare_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            collect_timeout_secs: default_collect_timeout_secs(),
        }
    }
}

impl Timeouts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn global_ceiling(&self) -> Duration {
        Duration::from_secs(self.global_ceiling_secs)
    }

    pub fn interruption_threshold(&self) -> Duration {
        Duration::from_secs(self.interruption_threshold_secs)
    }

    pub fn dispatch_grace(&self) -> Duration {
        Duration::from_secs(self.dispatch_grace_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_secs)
    }
}

/// Top-level fleet configuration
///
/// `cases` maps a case identity (e.g. `"mm:FP16:4096:nvlib:A100"`) to the
/// framework it runs under; case identities are opaque to the orchestrator
/// apart from filesystem sanitization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Host addresses, rank order = list order
    pub hosts: Vec<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// SSH user; defaults to the invoking user when absent
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// SSH identity file
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    /// Accelerator vendor name, used in image and container naming
    pub vendor: String,
    /// Path where the benchmark tree is deployed on every host
    pub deploy_path: PathBuf,
    /// Log root, relative to `deploy_path` or absolute; identical on every
    /// host and on the controller
    pub log_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Case identity -> framework
    pub cases: IndexMap<String, String>,
    #[serde(default = "default_nproc_per_node")]
    pub nproc_per_node: u32,
    /// Drop kernel caches on every host before dispatch
    #[serde(default)]
    pub clear_caches: bool,
    /// Extra entrypoint arguments passed through to every case
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub container: ContainerOptions,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Bound on re-dispatches of an interrupted run
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl FleetConfig {
    /// Load and validate a fleet config from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        debug!("Loading fleet config from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: FleetConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parsing {
                message: e.to_string(),
            })?;
        config.validate()?;
        info!(
            hosts = config.hosts.len(),
            cases = config.cases.len(),
            "Fleet config loaded"
        );
        Ok(config)
    }

    /// Validate required fields and invariants
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Validation {
                message: "hosts list is empty".to_string(),
            }
            .into());
        }
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.trim().is_empty() {
                return Err(ConfigError::Validation {
                    message: "host address is empty".to_string(),
                }
                .into());
            }
            if !seen.insert(host.as_str()) {
                return Err(ConfigError::Validation {
                    message: format!("duplicate host: {}", host),
                }
                .into());
            }
        }
        if self.cases.is_empty() {
            return Err(ConfigError::Validation {
                message: "no cases configured".to_string(),
            }
            .into());
        }
        if self.vendor.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "vendor is empty".to_string(),
            }
            .into());
        }
        if self.timeouts.poll_interval_secs == 0 {
            return Err(ConfigError::Validation {
                message: "poll_interval_secs must be positive".to_string(),
            }
            .into());
        }
        if let Some(template) = &self.container.custom_launch {
            if template.trim().is_empty() {
                return Err(ConfigError::Validation {
                    message: "custom_launch template is empty".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Build the host specs targeted by this session, in rank order
    pub fn fleet(&self) -> Vec<HostSpec> {
        self.hosts
            .iter()
            .map(|address| HostSpec {
                address: address.clone(),
                port: self.ssh_port,
                user: self.ssh_user.clone(),
                identity_file: self.ssh_key.clone(),
            })
            .collect()
    }

    /// Absolute log root (log_path resolved against deploy_path)
    pub fn log_root(&self) -> PathBuf {
        if self.log_path.is_absolute() {
            self.log_path.clone()
        } else {
            self.deploy_path.join(&self.log_path)
        }
    }
}
