use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Fatal orchestration errors get a clean message and exit code 1;
            // anyhow's default rendering covers the rest.
            if let Some(fleet_error) = err.downcast_ref::<fleetbench_core::errors::FleetError>() {
                eprintln!("Error: {}", fleet_error);
                std::process::exit(1);
            }
            Err(err)
        }
    }
}
