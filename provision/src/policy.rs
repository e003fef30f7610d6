//! Access policy for the migration runner
//!
//! The runner gets exactly the secret and objects it needs. A wildcard
//! scope exists as an explicit knob and is never the default.

use crate::context::DeploymentContext;
use crate::credentials::CredentialRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

pub const GET_SECRET_VALUE: &str = "secretsmanager:GetSecretValue";
pub const GET_OBJECT: &str = "s3:GetObject";

/// Network interface and log actions a network-attached function needs;
/// these cannot be scoped to a resource.
const UNSCOPED_ACTIONS: &[&str] = &[
    "ec2:CreateNetworkInterface",
    "ec2:DescribeNetworkInterfaces",
    "ec2:DeleteNetworkInterface",
    "ec2:AttachNetworkInterface",
    "ec2:DetachNetworkInterface",
    "logs:CreateLogGroup",
    "logs:CreateLogStream",
    "logs:PutLogEvents",
];

/// How broadly the runner policy is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    #[default]
    Narrow,
    Wildcard,
}

impl FromStr for PolicyScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "narrow" => Ok(Self::Narrow),
            "wildcard" => Ok(Self::Wildcard),
            other => Err(Error::validation(format!("unknown policy scope: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

impl PolicyStatement {
    fn new(actions: &[&str], resources: Vec<String>) -> Self {
        Self {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
        }
    }

    fn allows(&self, action: &str, resource: &str) -> bool {
        self.actions.iter().any(|a| pattern_matches(a, action))
            && self.resources.iter().any(|r| pattern_matches(r, resource))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub statements: Vec<PolicyStatement>,
}

impl AccessPolicy {
    /// Policy for a runner that reads `credential` and the given objects
    pub fn for_migration_runner(
        scope: PolicyScope,
        ctx: &DeploymentContext,
        credential: &CredentialRef,
        bucket: &str,
        keys: &[&str],
    ) -> Self {
        match scope {
            PolicyScope::Narrow => Self {
                statements: vec![
                    PolicyStatement::new(UNSCOPED_ACTIONS, vec!["*".to_string()]),
                    PolicyStatement::new(&[GET_SECRET_VALUE], vec![credential.id.clone()]),
                    PolicyStatement::new(
                        &[GET_OBJECT],
                        keys.iter().map(|key| ctx.object_arn(bucket, key)).collect(),
                    ),
                ],
            },
            PolicyScope::Wildcard => {
                warn!("Runner policy uses wildcard actions and resources");
                Self {
                    statements: vec![PolicyStatement::new(&["*"], vec!["*".to_string()])],
                }
            }
        }
    }

    pub fn allows(&self, action: &str, resource: &str) -> bool {
        self.statements.iter().any(|s| s.allows(action, resource))
    }
}

/// `*` matches anything; a trailing `*` matches any suffix
fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    fn credential() -> CredentialRef {
        CredentialRef {
            name: "db-master".to_string(),
            id: "arn:secret:db-master".to_string(),
        }
    }

    #[test]
    fn test_narrow_policy_grants_only_named_resources() {
        let ctx = test_context();
        let policy = AccessPolicy::for_migration_runner(
            PolicyScope::Narrow,
            &ctx,
            &credential(),
            "schema-bucket",
            &["schema.sql"],
        );

        assert!(policy.allows(GET_SECRET_VALUE, "arn:secret:db-master"));
        assert!(!policy.allows(GET_SECRET_VALUE, "arn:secret:other"));
        assert!(policy.allows(GET_OBJECT, "arn:aws:s3:::schema-bucket/schema.sql"));
        assert!(!policy.allows(GET_OBJECT, "arn:aws:s3:::schema-bucket/other.sql"));
        assert!(policy.allows("logs:PutLogEvents", "anything"));
        assert!(!policy.allows("s3:PutObject", "arn:aws:s3:::schema-bucket/schema.sql"));
    }

    #[test]
    fn test_wildcard_policy_is_explicit() {
        let ctx = test_context();
        assert_eq!(PolicyScope::default(), PolicyScope::Narrow);
        let policy = AccessPolicy::for_migration_runner(
            "wildcard".parse().unwrap(),
            &ctx,
            &credential(),
            "schema-bucket",
            &[],
        );
        assert!(policy.allows("s3:PutObject", "arn:aws:s3:::elsewhere/x"));
    }

    #[test]
    fn test_prefix_patterns() {
        assert!(pattern_matches("arn:aws:s3:::bucket/*", "arn:aws:s3:::bucket/a/b"));
        assert!(!pattern_matches("arn:aws:s3:::bucket/*", "arn:aws:s3:::other/a"));
        assert!(pattern_matches("*", ""));
    }
}
