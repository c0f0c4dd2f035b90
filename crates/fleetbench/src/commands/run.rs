//! Run command implementation
//!
//! Implements the `fleetbench run` subcommand: load and validate the fleet
//! config, then drive the full session pipeline over every configured case.

use anyhow::Result;
use fleetbench_core::cluster::SshCluster;
use fleetbench_core::config::FleetConfig;
use fleetbench_core::pipeline::{OperationWorkload, OrchestratorContext, Pipeline};
use fleetbench_core::poller::SystemClock;
use fleetbench_core::run::RunVerdict;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Run command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Fleet configuration file path
    pub config_path: PathBuf,
    /// Container launch template override
    pub custom_launch: Option<String>,
}

/// Execute the run command
#[instrument(skip(args))]
pub async fn execute_run(args: RunArgs) -> Result<()> {
    let mut config = FleetConfig::load(&args.config_path)?;
    if let Some(template) = args.custom_launch {
        config.container.custom_launch = Some(template);
        config.validate()?;
    }

    let context = OrchestratorContext {
        config,
        executor: Arc::new(SshCluster::new()),
        clock: Arc::new(SystemClock),
    };
    let pipeline = Pipeline::new(context, Box::new(OperationWorkload));
    let session = pipeline.execute().await?;

    for case in &session.cases {
        match (&case.verdict, &case.skipped) {
            (Some(verdict), _) => info!(
                case = %case.case,
                verdict = verdict.as_str(),
                attempts = case.attempts,
                "case result"
            ),
            (None, Some(reason)) => warn!(case = %case.case, reason = %reason, "case skipped"),
            (None, None) => warn!(case = %case.case, "case did not run"),
        }
    }
    if !session.collected_all {
        warn!("some host log trees could not be collected");
    }

    let succeeded = session
        .cases
        .iter()
        .filter(|c| c.verdict == Some(RunVerdict::Success))
        .count();
    info!(
        succeeded,
        total = session.cases.len(),
        logs = %session.layout_root.display(),
        "session complete"
    );

    // Machine-readable session summary on stdout; logs stay on stderr.
    let summary = serde_json::json!({
        "log_root": session.layout_root,
        "succeeded": succeeded,
        "total": session.cases.len(),
        "collected_all": session.collected_all,
    });
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
