//! Logging and observability
//!
//! This module provides structured logging setup for the orchestrator. It
//! supports both traditional text-based logging and optional JSON formatting,
//! controlled at runtime via environment variables and CLI flags.
//!
//! All logging output is directed to stderr to preserve stdout for command
//! output (for example the merged result document).

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the logging system with an optional format specification
///
/// Sets up tracing-subscriber with either JSON or text formatting based on
/// runtime configuration. It can be called multiple times safely; subsequent
/// calls are no-ops.
///
/// ## Arguments
///
/// * `format` - Optional format specification string. Supports:
///   - `None` or `"text"` for human-readable text format
///   - `"json"` for structured JSON format
///
/// ## Environment Variables
///
/// * `FLEETBENCH_LOG_FORMAT` - Controls the log output format ("json" for JSON,
///   any other value for text)
/// * `FLEETBENCH_LOG` - Controls the logging filter level
/// * `RUST_LOG` - Standard Rust logging environment variable (used as fallback)
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var("FLEETBENCH_LOG_FORMAT").ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                // Default to text format (including None, "text", or any other value)
                tracing_subscriber::registry()
                    .with(fmt::layer().with_target(true).with_writer(io::stderr))
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

/// Create an EnvFilter based on environment variables
fn create_env_filter() -> EnvFilter {
    if let Ok(fleet_log) = std::env::var("FLEETBENCH_LOG") {
        EnvFilter::try_new(&fleet_log).unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid FLEETBENCH_LOG specification '{}', using default 'info'",
                fleet_log
            );
            EnvFilter::new("info")
        })
    } else {
        // Fall back to standard RUST_LOG or default (info)
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Check if logging has been initialized
///
/// Primarily useful for testing scenarios where you need to know if the
/// logging system has already been set up.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
