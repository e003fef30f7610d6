//! Error types for the provisioning core

use std::time::Duration;
use thiserror::Error;

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed port or spec input, raised before anything is declared
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The provisioning engine failed to realize a declared resource
    #[error("Provisioning of {resource} failed: {reason}")]
    Provisioning { resource: String, reason: String },

    /// Migration invocation exceeded its bound
    #[error("Job {job} timed out after {after:?}")]
    Timeout { job: String, after: Duration },

    /// Live fetch of secret material failed
    #[error("Credential resolution failed: {0}")]
    CredentialResolution(String),

    /// Payload object could not be fetched or was outside the granted scope
    #[error("Payload unavailable: {0}")]
    Payload(String),

    /// Schema application against the cluster failed
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Unknown node, duplicate id or cycle in the declaration graph
    #[error("Graph error: {0}")]
    Graph(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provisioning error for `resource`
    pub fn provisioning(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provisioning {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(job: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            job: job.into(),
            after,
        }
    }

    /// Create a credential resolution error
    pub fn credential_resolution(msg: impl Into<String>) -> Self {
        Self::CredentialResolution(msg.into())
    }

    /// Create a payload error
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    /// Create a migration error
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    /// Create a graph error
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Whether the error stays inside a migration outcome.
    ///
    /// Contained errors leave provisioned infrastructure standing and move
    /// the trigger to `Failed`; they never tear anything down.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::CredentialResolution(_)
                | Self::Payload(_)
                | Self::Migration(_)
        )
    }

    /// Short name of the failing phase, used in telemetry.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validate",
            Self::Provisioning { .. } => "provision",
            Self::Timeout { .. } => "timeout",
            Self::CredentialResolution(_) => "resolve_credentials",
            Self::Payload(_) => "fetch_payload",
            Self::Migration(_) => "apply_schema",
            Self::Graph(_) => "graph",
            Self::Serialization(_) => "serialize",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("port 0");
        assert!(err.to_string().contains("Validation failed"));

        let err = Error::provisioning("cluster:db", "capacity");
        assert_eq!(err.to_string(), "Provisioning of cluster:db failed: capacity");
    }

    #[test]
    fn test_containment() {
        assert!(Error::timeout("job", Duration::from_secs(900)).is_contained());
        assert!(Error::credential_resolution("denied").is_contained());
        assert!(Error::payload("schema missing").is_contained());
        assert!(Error::migration("psql exited 3").is_contained());
        assert!(!Error::provisioning("cluster", "boom").is_contained());
        assert!(!Error::validation("bad").is_contained());
    }
}
