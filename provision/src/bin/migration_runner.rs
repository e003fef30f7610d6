//! Migration runner entrypoint
//!
//! Invoked once by the post-ready trigger. Resolves the master credential
//! from `DB_SECRET_REF`, fetches the schema named by `SCHEMA_BUCKET` and
//! `SCHEMA_FILE_KEY`, and applies it to `DB_HOST:DB_PORT` with psql.
//! Exits non-zero on any failure; it never retries.
//!
//! The runner does not evaluate its `AccessPolicy` itself. It relies on the
//! platform role it executes under, which is built from
//! `AccessPolicy::for_migration_runner` and grants read access to exactly
//! the secret and schema object named in its environment. Anything else is
//! denied by the platform before a byte reaches this process.

use anyhow::{Context, Result};
use common::{init_logging, ConfigExt, Telemetry, TelemetryEvent};
use provision::{
    Credential, CredentialRef, DirObjectStore, Endpoint, FileSecretBackend, MigrationTarget,
    ObjectStore, PsqlApplier, SchemaApplier, SecretBackend,
};
use std::collections::BTreeMap;
use std::env;
use std::time::Instant;
use tracing::{error, info};

const JOB: &str = "initialize-db";

struct RunnerEnv {
    secret_ref: String,
    host: String,
    port: u16,
    bucket: String,
    schema_key: String,
    secrets_dir: String,
    payload_root: String,
}

impl RunnerEnv {
    fn from_env() -> Result<Self> {
        let port = String::env_required("DB_PORT")?;
        Ok(Self {
            secret_ref: String::env_required("DB_SECRET_REF")?,
            host: String::env_required("DB_HOST")?,
            port: port.parse().with_context(|| format!("DB_PORT {} is not a port", port))?,
            bucket: String::env_required("SCHEMA_BUCKET")?,
            schema_key: String::env_required("SCHEMA_FILE_KEY")?,
            secrets_dir: String::env_or("SECRETS_DIR", "/run/secrets"),
            payload_root: String::env_or("PAYLOAD_ROOT", "/var/task/payload"),
        })
    }

    /// Environment as the job sees it, minus anything secret
    fn visible(&self) -> BTreeMap<String, String> {
        [
            ("DB_SECRET_REF", self.secret_ref.clone()),
            ("DB_HOST", self.host.clone()),
            ("DB_PORT", self.port.to_string()),
            ("SCHEMA_BUCKET", self.bucket.clone()),
            ("SCHEMA_FILE_KEY", self.schema_key.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

async fn run(config: &RunnerEnv) -> provision::Result<usize> {
    let client = common::psql_version()
        .await
        .map_err(|e| provision::Error::migration(format!("psql unavailable: {:#}", e)))?;
    info!(%client, "psql client found");

    let reference = CredentialRef::from_id(&config.secret_ref)?;
    let material = FileSecretBackend::new(&config.secrets_dir).get(&reference).await?;
    info!(secret = %reference.name, user = %material.username, "Credential resolved");

    let body = DirObjectStore::new(&config.payload_root)
        .get(&config.bucket, &config.schema_key)
        .await?;
    let schema = String::from_utf8(body).map_err(|_| {
        provision::Error::payload(format!("{} is not valid UTF-8", config.schema_key))
    })?;
    info!(bytes = schema.len(), key = %config.schema_key, "Schema fetched");

    let credential = Credential {
        reference,
        database_name: material.dbname,
        username: material.username,
        password: material.password,
    };
    let endpoint = Endpoint {
        host: config.host.clone(),
        port: config.port,
    };
    PsqlApplier
        .apply(&MigrationTarget {
            endpoint: &endpoint,
            credential: &credential,
            schema: &schema,
            environment: &config.visible(),
        })
        .await?;

    Ok(schema.len())
}

fn fail(telemetry: &Telemetry, error: String, phase: &str) -> ! {
    error!(%error, phase, "Migration failed");
    if let Err(e) = telemetry.send_sync(TelemetryEvent::MigrationFailed {
        job: JOB.to_string(),
        error,
        phase: phase.to_string(),
    }) {
        error!(error = %e, "Failed to deliver telemetry");
    }
    std::process::exit(1);
}

fn main() -> Result<()> {
    let _guard = init_logging("migration-runner");
    let telemetry = Telemetry::from_env("migration-runner");

    let config = match RunnerEnv::from_env() {
        Ok(c) => c,
        Err(e) => fail(&telemetry, format!("{:#}", e), "read_config"),
    };

    let target = format!("{}:{}", config.host, config.port);
    info!(%target, "Migration runner starting");
    telemetry.send(TelemetryEvent::MigrationStarted {
        job: JOB.to_string(),
        target,
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let start = Instant::now();
    // Blocking telemetry must stay outside the runtime
    let outcome = runtime.block_on(run(&config));
    drop(runtime);

    match outcome {
        Ok(schema_bytes) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            info!(duration_ms, schema_bytes, "Migration complete");
            if let Err(e) = telemetry.send_sync(TelemetryEvent::MigrationCompleted {
                job: JOB.to_string(),
                duration_ms,
                schema_bytes,
            }) {
                error!(error = %e, "Failed to deliver telemetry");
            }
            Ok(())
        }
        Err(e) => {
            let phase = e.phase();
            fail(&telemetry, e.to_string(), phase)
        }
    }
}
