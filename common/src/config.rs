//! Environment variable parsing helpers
//!
//! Provides ergonomic helpers for reading configuration from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Extension trait for parsing environment variables.
///
/// Provides convenient methods for reading env vars with defaults, required values,
/// and type parsing.
pub trait ConfigExt {
    /// Get an environment variable with a default value.
    ///
    /// # Example
    /// ```ignore
    /// let bucket = String::env_or("SCHEMA_BUCKET", "schema-bucket");
    /// ```
    fn env_or(name: &str, default: &str) -> String {
        env::var(name).unwrap_or_else(|_| default.to_string())
    }

    /// Get a required environment variable, returning an error if not set or empty.
    fn env_required(name: &str) -> Result<String> {
        let value = env::var(name).context(format!("{} must be set", name))?;
        if value.trim().is_empty() {
            anyhow::bail!("{} must not be empty", name);
        }
        Ok(value)
    }

    /// Get an environment variable as a boolean.
    ///
    /// Returns `true` if the value is "true" (case-insensitive), otherwise `default`.
    fn env_bool(name: &str, default: bool) -> bool {
        env::var(name)
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(default)
    }

    /// Get an environment variable parsed as a specific type.
    ///
    /// Returns `default` if the variable is not set or fails to parse.
    ///
    /// # Example
    /// ```ignore
    /// let timeout: u64 = u64::env_parse("MIGRATION_TIMEOUT_SECS", 900);
    /// ```
    fn env_parse<T: FromStr>(name: &str, default: T) -> T {
        env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Get a comma-separated environment variable as a list.
    ///
    /// Empty entries are dropped; an unset variable yields an empty list.
    fn env_list(name: &str) -> Vec<String> {
        env::var(name)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// Blanket implementation for all types
impl<T> ConfigExt for T {}

/// Deployment target environment.
///
/// Accessors for the account, region and network substrate a stack is
/// deployed into. Only binaries read these; library code receives the values
/// through an explicit context.
pub struct DeployEnv;

impl DeployEnv {
    /// Target account identifier.
    pub fn account_id() -> Result<String> {
        String::env_required("DEPLOY_ACCOUNT_ID")
    }

    /// Target region.
    pub fn region() -> Result<String> {
        String::env_required("DEPLOY_REGION")
    }

    /// Logical stack name used to qualify resource identifiers.
    pub fn stack_name() -> String {
        String::env_or("DEPLOY_STACK_NAME", "database-stack")
    }

    /// Virtual network the stack is placed in.
    pub fn vpc_id() -> Result<String> {
        String::env_required("DEPLOY_VPC_ID")
    }

    /// Subnet classification, "public" or "private".
    pub fn subnet_type() -> String {
        String::env_or("DEPLOY_SUBNET_TYPE", "private")
    }

    /// Endpoint receiving telemetry events, if any.
    pub fn telemetry_endpoint() -> Option<String> {
        env::var("DEPLOY_TELEMETRY_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}
