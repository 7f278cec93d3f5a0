//! Per-host self-healing daemon for Consul service pools.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
// OpenSSL is only needed for static linking on Linux
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
use strum as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Consul agent client.
pub mod consul;

/// Per-tick control flow and shared runtime state.
pub mod daemon;

/// Hysteresis and cluster-safety decisions.
pub mod decision;

/// Child-process environment encoding.
pub mod environment;

/// Errors.
pub mod error;

/// Heal orchestration.
pub mod heal;

/// Retry ledgers.
pub mod ledger;

/// PID file guard.
pub mod pidfile;

/// Status report writer.
pub mod report;

/// Script execution.
pub mod runner;

/// Check and heal timers.
pub mod scheduler;

/// Exit-code and status vocabulary.
pub mod verdict;
