//! Check command implementation
//!
//! Implements the `fleetbench check` subcommand: the session preflight
//! (host reachability plus deploy-path probe) without running any case.

use anyhow::Result;
use fleetbench_core::cluster::SshCluster;
use fleetbench_core::config::FleetConfig;
use fleetbench_core::pipeline::{OperationWorkload, OrchestratorContext, Pipeline};
use fleetbench_core::poller::SystemClock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

/// Check command arguments
#[derive(Debug, Clone)]
pub struct CheckArgs {
    /// Fleet configuration file path
    pub config_path: PathBuf,
}

/// Execute the check command
#[instrument(skip(args))]
pub async fn execute_check(args: CheckArgs) -> Result<()> {
    let config = FleetConfig::load(&args.config_path)?;
    let hosts = config.hosts.len();
    let cases = config.cases.len();

    let context = OrchestratorContext {
        config,
        executor: Arc::new(SshCluster::new()),
        clock: Arc::new(SystemClock),
    };
    let pipeline = Pipeline::new(context, Box::new(OperationWorkload));
    pipeline.preflight().await?;

    info!(hosts, cases, "fleet check passed");
    println!("OK: {} hosts reachable, {} cases configured", hosts, cases);
    Ok(())
}
