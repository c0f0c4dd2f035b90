//! Core library for the fleet benchmark orchestrator
//!
//! This crate contains the shared logic for fleet configuration, fan-out SSH
//! execution, container lifecycle management, detached task dispatch,
//! completion polling with bounded retries, log collection, result
//! aggregation, logging, and error handling.

pub mod cluster;
pub mod collect;
pub mod config;
pub mod container;
pub mod errors;
pub mod launcher;
pub mod layout;
pub mod logging;
pub mod markers;
pub mod pipeline;
pub mod poller;
pub mod results;
pub mod run;

#[cfg(test)]
mod testing;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
