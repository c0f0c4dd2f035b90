//! Error types and handling
//!
//! This module provides domain-specific error types for the orchestration
//! core. The taxonomy is structured with specific error enums for each domain
//! (configuration, remote transport, containers, runs) that are then wrapped
//! in the main FleetError enum for unified error handling.
//!
//! Only the fatal class (unreachable hosts, invalid config) is expected to
//! abort a session; per-host and per-case failures are reported through
//! `HostReport` values and logs instead of errors.

use thiserror::Error;

/// Fleet configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse fleet config: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Fleet config validation error: {message}")]
    Validation { message: String },

    /// Configuration file not found
    #[error("Fleet config not found: {path}")]
    NotFound { path: String },

    /// Deployment path missing on one or more hosts
    #[error("Deploy path {path} missing on hosts: {hosts}")]
    DeployPath { path: String, hosts: String },

    /// Configuration file I/O error
    #[error("Failed to read fleet config")]
    Io(#[from] std::io::Error),
}

/// Remote transport (ssh/scp) errors
#[derive(Error, Debug)]
pub enum SshError {
    /// One or more hosts failed the reachability probe
    #[error("Unreachable hosts: {hosts}")]
    Unreachable { hosts: String },

    /// Local spawn of the transport binary failed
    #[error("Failed to spawn {tool}: {message}")]
    Spawn { tool: String, message: String },

    /// Remote command returned a non-zero exit status
    #[error("Remote command failed on {host}: {reason}")]
    CommandFailed { host: String, reason: String },

    /// Remote command exceeded its per-host timeout
    #[error("Remote command timed out on {host} after {seconds}s")]
    Timeout { host: String, seconds: u64 },
}

/// Container lifecycle errors
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Container failed to start on a host
    #[error("Container {container} failed to start on {host}: {reason}")]
    StartFailed {
        host: String,
        container: String,
        reason: String,
    },

    /// Container started but the liveness probe failed
    #[error("Container {container} failed liveness probe on {host}")]
    ProbeFailed { host: String, container: String },

    /// Launch template could not be interpreted
    #[error("Invalid container launch template: {message}")]
    InvalidTemplate { message: String },
}

/// Run and result handling errors
#[derive(Error, Debug)]
pub enum RunError {
    /// Detached task dispatch failed on every targeted host
    #[error("Task dispatch failed for case {case} on hosts: {hosts}")]
    DispatchFailed { case: String, hosts: String },

    /// Result log line could not be parsed
    #[error("Result log parse error: {message}")]
    ResultParse { message: String },

    /// Marker or layout I/O error
    #[error("Run layout I/O error")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Result JSON error")]
    Json(#[from] serde_json::Error),
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum FleetError {
    /// Fleet configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Remote transport errors
    #[error("Transport error: {0}")]
    Ssh(#[from] SshError),

    /// Container lifecycle errors
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// Run and result handling errors
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// Internal/generic errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Convenience type alias for Results with FleetError
pub type Result<T> = std::result::Result<T, FleetError>;
