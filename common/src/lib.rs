//! Shared utilities for the database stack components
//!
//! This crate provides common functionality used by the planner and the
//! migration runner:
//! - Structured logging initialization
//! - Environment variable parsing helpers
//! - Command execution utilities
//! - Telemetry for reporting deployment events

pub mod command;
pub mod config;
pub mod logging;
pub mod telemetry;

pub use command::{psql_script, psql_version, run, run_checked, run_with_input, CommandOutput};
pub use config::{ConfigExt, DeployEnv};
pub use logging::init_logging;
pub use telemetry::{Telemetry, TelemetryEvent};
