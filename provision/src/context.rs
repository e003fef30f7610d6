//! Deployment context
//!
//! Account, region and network substrate are passed explicitly into every
//! component constructor. Nothing in the core reads ambient state.

use crate::error::{Error, Result};
use anyhow::Context as _;
use common::DeployEnv;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subnet classification the stack is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetType {
    Public,
    Private,
}

impl FromStr for SubnetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            other => Err(Error::validation(format!("unknown subnet type: {}", other))),
        }
    }
}

impl fmt::Display for SubnetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
        }
    }
}

/// Reference to the virtual network a stack lives in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcRef {
    pub id: String,
    pub subnet_type: SubnetType,
}

/// Explicit deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub account_id: String,
    pub region: String,
    pub stack_name: String,
    pub vpc: VpcRef,
}

impl DeploymentContext {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        stack_name: impl Into<String>,
        vpc: VpcRef,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            stack_name: stack_name.into(),
            vpc,
        }
    }

    /// Load the context from `DEPLOY_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let subnet_type = DeployEnv::subnet_type()
            .parse::<SubnetType>()
            .context("Invalid DEPLOY_SUBNET_TYPE")?;

        Ok(Self {
            account_id: DeployEnv::account_id()?,
            region: DeployEnv::region()?,
            stack_name: DeployEnv::stack_name(),
            vpc: VpcRef {
                id: DeployEnv::vpc_id()?,
                subnet_type,
            },
        })
    }

    /// Stable reference id for a secret stored under `name`
    pub fn secret_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:secretsmanager:{}:{}:secret:{}",
            self.region, self.account_id, name
        )
    }

    /// Object resource id for `key` in `bucket`
    pub fn object_arn(&self, bucket: &str, key: &str) -> String {
        format!("arn:aws:s3:::{}/{}", bucket, key)
    }

    /// Stack-qualified name for a resource
    pub fn qualify(&self, name: &str) -> String {
        format!("{}/{}", self.stack_name, name)
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> DeploymentContext {
    DeploymentContext::new(
        "123456789012",
        "eu-west-1",
        "test-stack",
        VpcRef {
            id: "vpc-0abc".to_string(),
            subnet_type: SubnetType::Private,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_type_parsing() {
        assert_eq!("Public".parse::<SubnetType>().unwrap(), SubnetType::Public);
        assert_eq!(" private ".parse::<SubnetType>().unwrap(), SubnetType::Private);
        assert!("isolated".parse::<SubnetType>().is_err());
    }

    #[test]
    fn test_secret_arn_uses_explicit_context() {
        let ctx = test_context();
        assert_eq!(
            ctx.secret_arn("db-master"),
            "arn:aws:secretsmanager:eu-west-1:123456789012:secret:db-master"
        );
        assert_eq!(ctx.qualify("db-sg"), "test-stack/db-sg");
    }
}
