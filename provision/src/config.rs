//! Stack configuration
//!
//! `RdsConfig` comes from a YAML file (`RDS_CONFIG_FILE`) or from `RDS_*`
//! environment variables. `StackOptions` carries the knobs around it.

use crate::cluster::{EngineKind, InstanceSpec};
use crate::credentials::Password;
use crate::error::{Error, Result};
use crate::graph::{RemovalPolicy, ResourceNode};
use crate::migration::DEFAULT_TIMEOUT;
use crate::policy::PolicyScope;
use crate::trigger::InvocationType;
use anyhow::Context;
use common::ConfigExt;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Database sizing and master credentials
#[derive(Debug, Clone, Deserialize)]
pub struct RdsConfig {
    pub writer_instance_class: String,
    pub writer_instance_size: String,
    /// A reader instance is declared only when both are set
    #[serde(default)]
    pub reader_instance_class: Option<String>,
    #[serde(default)]
    pub reader_instance_size: Option<String>,
    pub port: u32,
    pub db_user: String,
    pub password: Password,
}

impl RdsConfig {
    /// Load from `RDS_CONFIG_FILE` when set, otherwise from the environment
    pub fn load() -> anyhow::Result<Self> {
        match env::var("RDS_CONFIG_FILE") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Self::from_env(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            writer_instance_class: String::env_or("RDS_WRITER_INSTANCE_CLASS", "r6g"),
            writer_instance_size: String::env_or("RDS_WRITER_INSTANCE_SIZE", "large"),
            reader_instance_class: env::var("RDS_READER_INSTANCE_CLASS").ok(),
            reader_instance_size: env::var("RDS_READER_INSTANCE_SIZE").ok(),
            port: u32::env_parse("RDS_PORT", 5432),
            db_user: String::env_or("RDS_DB_USER", "db_user"),
            password: Password::new(String::env_required("RDS_DB_PASSWORD")?),
        })
    }

    pub fn writer(&self) -> InstanceSpec {
        InstanceSpec::new(&self.writer_instance_class, &self.writer_instance_size)
    }

    /// Reader sizing, when both class and size are configured
    pub fn reader(&self) -> Option<InstanceSpec> {
        match (&self.reader_instance_class, &self.reader_instance_size) {
            (Some(class), Some(size)) => Some(InstanceSpec::new(class, size)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.writer_instance_class.trim().is_empty()
            || self.writer_instance_size.trim().is_empty()
        {
            return Err(Error::validation("writer instance class and size are required"));
        }
        if self.port == 0 || self.port > 65535 {
            return Err(Error::validation(format!("port {} outside [1, 65535]", self.port)));
        }
        if self.db_user.trim().is_empty() {
            return Err(Error::validation("db_user must not be empty"));
        }
        if self.password.is_empty() {
            return Err(Error::validation("password must not be empty"));
        }
        Ok(())
    }
}

/// Knobs of the database stack; defaults are the narrow posture
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub database_name: String,
    pub secret_name: String,
    pub cluster_identifier: String,
    pub engine: EngineKind,
    pub schema_bucket: String,
    pub code_key: String,
    pub schema_key: String,
    pub migration_timeout: Duration,
    pub publicly_accessible: bool,
    pub policy_scope: PolicyScope,
    pub credential_removal: RemovalPolicy,
    pub cluster_removal: RemovalPolicy,
    pub invocation_type: InvocationType,
    /// Resources that must wait for the migration trigger
    pub gated_resources: Vec<ResourceNode>,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            database_name: "app".to_string(),
            secret_name: "db-master-user-secret".to_string(),
            cluster_identifier: "db-cluster".to_string(),
            engine: EngineKind::default(),
            schema_bucket: "schema-bucket".to_string(),
            code_key: "migration_runner.zip".to_string(),
            schema_key: "schema.sql".to_string(),
            migration_timeout: DEFAULT_TIMEOUT,
            publicly_accessible: false,
            policy_scope: PolicyScope::Narrow,
            credential_removal: RemovalPolicy::Destroy,
            cluster_removal: RemovalPolicy::Destroy,
            invocation_type: InvocationType::Event,
            gated_resources: Vec::new(),
        }
    }
}

impl StackOptions {
    /// Defaults overridden by `STACK_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let policy_scope = String::env_or("STACK_POLICY_SCOPE", "narrow")
            .parse()
            .context("Invalid STACK_POLICY_SCOPE")?;
        let invocation_type = String::env_or("STACK_INVOCATION_TYPE", "event")
            .parse()
            .context("Invalid STACK_INVOCATION_TYPE")?;
        let credential_removal = if bool::env_bool("STACK_RETAIN_CREDENTIAL", false) {
            RemovalPolicy::Retain
        } else {
            RemovalPolicy::Destroy
        };

        Ok(Self {
            database_name: String::env_or("STACK_DATABASE_NAME", &defaults.database_name),
            secret_name: String::env_or("STACK_SECRET_NAME", &defaults.secret_name),
            cluster_identifier: String::env_or(
                "STACK_CLUSTER_IDENTIFIER",
                &defaults.cluster_identifier,
            ),
            engine: EngineKind::AuroraPostgres(String::env_or("STACK_ENGINE_VERSION", "13.7")),
            schema_bucket: String::env_or("STACK_SCHEMA_BUCKET", &defaults.schema_bucket),
            code_key: String::env_or("STACK_CODE_KEY", &defaults.code_key),
            schema_key: String::env_or("STACK_SCHEMA_KEY", &defaults.schema_key),
            migration_timeout: Duration::from_secs(u64::env_parse(
                "STACK_MIGRATION_TIMEOUT_SECS",
                defaults.migration_timeout.as_secs(),
            )),
            publicly_accessible: bool::env_bool("STACK_PUBLICLY_ACCESSIBLE", false),
            policy_scope,
            credential_removal,
            cluster_removal: defaults.cluster_removal,
            invocation_type,
            gated_resources: defaults.gated_resources,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("database name", &self.database_name),
            ("secret name", &self.secret_name),
            ("cluster identifier", &self.cluster_identifier),
            ("schema bucket", &self.schema_bucket),
            ("code key", &self.code_key),
            ("schema key", &self.schema_key),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{} must not be empty", what)));
            }
        }
        let timeout = self.migration_timeout;
        if timeout.as_secs() == 0 || timeout.subsec_nanos() != 0 {
            return Err(Error::validation(format!(
                "migration timeout must be a whole number of seconds, got {:?}",
                timeout
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
writer_instance_class: r6g
writer_instance_size: xlarge
port: 5432
db_user: admin
password: "s3cret-pass"
"#;

    #[test]
    fn test_parse_yaml_config() {
        let config: RdsConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.writer().instance_type(), "db.r6g.xlarge");
        assert!(config.reader().is_none());
        assert_eq!(config.password.expose(), "s3cret-pass");
        assert!(!format!("{:?}", config).contains("s3cret-pass"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_port_and_blank_user() {
        let mut config: RdsConfig = serde_yaml::from_str(YAML).unwrap();
        config.port = 70000;
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let mut config: RdsConfig = serde_yaml::from_str(YAML).unwrap();
        config.db_user = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_options_are_narrow() {
        let options = StackOptions::default();
        assert!(!options.publicly_accessible);
        assert_eq!(options.policy_scope, PolicyScope::Narrow);
        assert_eq!(options.migration_timeout, DEFAULT_TIMEOUT);
        assert!(options.validate().is_ok());

        let mut options = StackOptions::default();
        options.schema_key = String::new();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sub_second_timeout() {
        for timeout in [
            Duration::ZERO,
            Duration::from_millis(500),
            Duration::from_millis(1500),
        ] {
            let options = StackOptions {
                migration_timeout: timeout,
                ..Default::default()
            };
            let err = options.validate().unwrap_err();
            assert!(err.to_string().contains("whole number of seconds"), "{}", err);
        }

        let options = StackOptions {
            migration_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }
}
