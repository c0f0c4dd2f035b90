use crate::commands;
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

/// Fleet benchmark subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every configured case across the fleet
    Run {
        /// Full container launch template overriding the structured launch
        /// assembly; `{CONTAINER_NAME}` is substituted per case
        #[arg(long, value_name = "TEMPLATE")]
        custom_launch: Option<String>,
    },
    /// Probe host reachability and the deploy path without running cases
    Check,
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Fleet benchmark orchestrator",
    long_about = "Fleet benchmark orchestrator\n\nDrives containerized benchmark cases across a fleet of hosts over SSH: container preparation, detached task dispatch, completion polling with bounded retries, and log collection.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via FLEETBENCH_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Fleet configuration file path
    #[arg(long, global = true, value_name = "PATH", default_value = "fleet.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        // Initialize logging based on global options
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None, // Let logging module check environment variable
        };

        let log_level = match self.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };

        // Set the filter before init so the flag wins over nothing but never
        // over an explicit environment override.
        if std::env::var_os("FLEETBENCH_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var(
                "RUST_LOG",
                format!("fleetbench={},fleetbench_core={}", log_level, log_level),
            );
        }
        fleetbench_core::logging::init(log_format)?;

        tracing::debug!("CLI initialized with log level: {}", log_level);

        match self.command {
            Commands::Run { custom_launch } => {
                commands::run::execute_run(commands::run::RunArgs {
                    config_path: self.config,
                    custom_launch,
                })
                .await
            }
            Commands::Check => {
                commands::check::execute_check(commands::check::CheckArgs {
                    config_path: self.config,
                })
                .await
            }
        }
    }
}
