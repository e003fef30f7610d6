//! Migration runner
//!
//! A short-lived, network-attached job that applies a schema payload to the
//! cluster. Its definition carries references only: the credential is
//! resolved and the schema fetched when the job is invoked, never earlier.

use crate::boundary::NetworkBoundary;
use crate::cluster::{ClusterHandle, Endpoint};
use crate::context::DeploymentContext;
use crate::credentials::{Credential, CredentialRef, CredentialStore};
use crate::error::{Error, Result};
use crate::policy::{AccessPolicy, GET_OBJECT, GET_SECRET_VALUE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument};

/// Default bound on a single invocation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_RUNTIME: &str = "provided.al2023";
pub const DEFAULT_HANDLER: &str = "migration-runner";

/// Where the runner code and the schema live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadLocation {
    pub bucket: String,
    pub code_key: String,
    pub schema_key: String,
}

/// Environment value, resolved at invocation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EnvBinding {
    /// Reference id of a secret, never its value
    SecretRef(CredentialRef),
    ClusterHost,
    ClusterPort,
    Literal(String),
}

/// Declarative description of the migration job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub payload: PayloadLocation,
    pub credential: CredentialRef,
    pub environment: BTreeMap<String, EnvBinding>,
    pub boundary: String,
    pub timeout_secs: u64,
    pub policy: AccessPolicy,
}

impl MigrationJob {
    /// Job with the standard environment bindings and a 15 minute bound
    pub fn new(
        name: impl Into<String>,
        payload: PayloadLocation,
        credential: CredentialRef,
        boundary: &NetworkBoundary,
        policy: AccessPolicy,
    ) -> Self {
        let mut environment = BTreeMap::new();
        environment.insert("DB_SECRET_REF".to_string(), EnvBinding::SecretRef(credential.clone()));
        environment.insert("DB_HOST".to_string(), EnvBinding::ClusterHost);
        environment.insert("DB_PORT".to_string(), EnvBinding::ClusterPort);
        environment.insert(
            "SCHEMA_BUCKET".to_string(),
            EnvBinding::Literal(payload.bucket.clone()),
        );
        environment.insert(
            "SCHEMA_FILE_KEY".to_string(),
            EnvBinding::Literal(payload.schema_key.clone()),
        );

        Self {
            name: name.into(),
            runtime: DEFAULT_RUNTIME.to_string(),
            handler: DEFAULT_HANDLER.to_string(),
            payload,
            credential,
            environment,
            boundary: boundary.name().to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            policy,
        }
    }

    /// Fractional seconds round up so the bound is never shorter than asked.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("migration job needs a name"));
        }
        if self.timeout_secs == 0 {
            return Err(Error::validation(format!("job {} has a zero timeout", self.name)));
        }
        let p = &self.payload;
        if p.bucket.is_empty() || p.code_key.is_empty() || p.schema_key.is_empty() {
            return Err(Error::validation(format!(
                "job {} needs a payload bucket, code key and schema key",
                self.name
            )));
        }
        Ok(())
    }
}

/// Object storage holding the payload
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Object store kept in process memory
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bucket.to_string(), key.to_string()), body.into());
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::payload(format!("{}/{} not found", bucket, key)))
    }
}

/// Object store mapping `bucket/key` onto `<root>/<bucket>/<key>`
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.root.join(bucket).join(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::payload(format!("read {}: {}", path.display(), e)))
    }
}

/// Everything the applier sees for one invocation
pub struct MigrationTarget<'a> {
    pub endpoint: &'a Endpoint,
    pub credential: &'a Credential,
    pub schema: &'a str,
    pub environment: &'a BTreeMap<String, String>,
}

/// Applies a schema payload against the cluster
#[async_trait]
pub trait SchemaApplier: Send + Sync {
    async fn apply(&self, target: &MigrationTarget<'_>) -> Result<()>;
}

/// Applies the schema with `psql`
pub struct PsqlApplier;

#[async_trait]
impl SchemaApplier for PsqlApplier {
    async fn apply(&self, target: &MigrationTarget<'_>) -> Result<()> {
        common::psql_script(
            &target.endpoint.host,
            target.endpoint.port,
            &target.credential.database_name,
            &target.credential.username,
            target.credential.password.expose(),
            target.schema,
        )
        .await
        .map(|_| ())
        .map_err(|e| Error::migration(format!("{:#}", e)))
    }
}

/// Collaborators a job uses at invocation time
#[derive(Clone)]
pub struct RunnerDeps {
    pub credentials: Arc<CredentialStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub applier: Arc<dyn SchemaApplier>,
}

/// Summary of a successful invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job: String,
    pub duration: Duration,
    pub schema_bytes: usize,
}

/// Handle to a defined migration job
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    job: Arc<MigrationJob>,
    schema_resource: String,
    deps: RunnerDeps,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

/// Define a migration job that reaches `cluster` through `cluster_boundary`.
///
/// The cluster boundary must already admit the runner boundary on the
/// cluster port, and the job policy must cover its secret and schema object.
/// The job is granted read access to its credential here.
pub fn define(
    ctx: &DeploymentContext,
    job: MigrationJob,
    cluster: &ClusterHandle,
    cluster_boundary: &NetworkBoundary,
    runner_boundary: &NetworkBoundary,
    deps: RunnerDeps,
) -> Result<JobHandle> {
    job.validate()?;

    if job.boundary != runner_boundary.name() {
        return Err(Error::validation(format!(
            "job {} is attached to {} but was defined with {}",
            job.name,
            job.boundary,
            runner_boundary.name()
        )));
    }
    if !cluster_boundary.allows_ingress(&runner_boundary.as_peer(), cluster.port()) {
        return Err(Error::validation(format!(
            "{} does not admit {} on {}",
            cluster_boundary.name(),
            runner_boundary.name(),
            cluster.port()
        )));
    }

    let schema_resource = ctx.object_arn(&job.payload.bucket, &job.payload.schema_key);
    if !job.policy.allows(GET_SECRET_VALUE, &job.credential.id) {
        return Err(Error::validation(format!(
            "job {} policy cannot read its credential",
            job.name
        )));
    }
    if !job.policy.allows(GET_OBJECT, &schema_resource) {
        return Err(Error::validation(format!(
            "job {} policy cannot read {}",
            job.name, schema_resource
        )));
    }

    let id = format!("job:{}", job.name);
    deps.credentials.grant_read(&job.credential, &id)?;

    info!(
        job = %job.name,
        timeout_secs = job.timeout_secs,
        boundary = %job.boundary,
        "Migration job defined"
    );
    Ok(JobHandle {
        id,
        job: Arc::new(job),
        schema_resource,
        deps,
    })
}

impl JobHandle {
    /// Graph node id, also the principal the job acts as
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &MigrationJob {
        &self.job
    }

    /// Run the job once against `endpoint`, bounded by the job timeout.
    ///
    /// The runner never retries; the caller decides what a failure means.
    #[instrument(skip_all, fields(job = %self.job.name, endpoint = %endpoint))]
    pub async fn invoke(&self, endpoint: &Endpoint) -> Result<JobReport> {
        let bound = self.job.timeout();
        let started = Instant::now();

        match tokio::time::timeout(bound, self.execute(endpoint)).await {
            Ok(Ok(schema_bytes)) => {
                let duration = started.elapsed();
                info!(duration_ms = duration.as_millis() as u64, schema_bytes, "Migration applied");
                Ok(JobReport {
                    job: self.job.name.clone(),
                    duration,
                    schema_bytes,
                })
            }
            Ok(Err(e)) => {
                error!(error = %e, phase = e.phase(), "Migration failed");
                Err(e)
            }
            Err(_) => {
                error!(timeout_secs = bound.as_secs(), "Migration timed out");
                Err(Error::timeout(self.job.name.clone(), bound))
            }
        }
    }

    async fn execute(&self, endpoint: &Endpoint) -> Result<usize> {
        let job = &self.job;

        if !job.policy.allows(GET_SECRET_VALUE, &job.credential.id) {
            return Err(Error::credential_resolution(format!(
                "policy denies reading {}",
                job.credential.name
            )));
        }
        let credential = self.deps.credentials.resolve(&job.credential, &self.id).await?;

        if !job.policy.allows(GET_OBJECT, &self.schema_resource) {
            return Err(Error::payload(format!("policy denies reading {}", self.schema_resource)));
        }
        let body = self
            .deps
            .objects
            .get(&job.payload.bucket, &job.payload.schema_key)
            .await
            .map_err(|e| match e {
                Error::Payload(_) => e,
                other => Error::payload(other.to_string()),
            })?;
        let schema = String::from_utf8(body)
            .map_err(|_| Error::payload(format!("{} is not valid UTF-8", job.payload.schema_key)))?;

        let environment = self.resolve_environment(endpoint);
        self.deps
            .applier
            .apply(&MigrationTarget {
                endpoint,
                credential: &credential,
                schema: &schema,
                environment: &environment,
            })
            .await
            .map_err(|e| match e {
                Error::Migration(_) => e,
                other => Error::migration(other.to_string()),
            })?;

        Ok(schema.len())
    }

    fn resolve_environment(&self, endpoint: &Endpoint) -> BTreeMap<String, String> {
        self.job
            .environment
            .iter()
            .map(|(name, binding)| {
                let value = match binding {
                    EnvBinding::SecretRef(reference) => reference.id.clone(),
                    EnvBinding::ClusterHost => endpoint.host.clone(),
                    EnvBinding::ClusterPort => endpoint.port.to_string(),
                    EnvBinding::Literal(value) => value.clone(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Applier that records calls and can be told to fail or hang
    #[derive(Default)]
    pub struct ScriptedApplier {
        pub calls: AtomicUsize,
        pub fail_with: Option<String>,
        pub hang: bool,
        pub seen: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    }

    impl ScriptedApplier {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SchemaApplier for ScriptedApplier {
        async fn apply(&self, target: &MigrationTarget<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((target.credential.username.clone(), target.environment.clone()));
            if self.hang {
                std::future::pending::<()>().await;
            }
            match &self.fail_with {
                Some(msg) => Err(Error::migration(msg.clone())),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedApplier;
    use super::*;
    use crate::boundary::Peer;
    use crate::cluster::{self, test_spec};
    use crate::context::test_context;
    use crate::credentials::{InMemorySecretBackend, Password};
    use crate::graph::RemovalPolicy;
    use crate::policy::PolicyScope;

    struct Fixture {
        ctx: DeploymentContext,
        db_sg: NetworkBoundary,
        runner_sg: NetworkBoundary,
        cluster: ClusterHandle,
        credentials: Arc<CredentialStore>,
        objects: Arc<InMemoryObjectStore>,
        credential: CredentialRef,
    }

    fn fixture() -> Fixture {
        let ctx = test_context();
        let backend = Arc::new(InMemorySecretBackend::new());
        let credentials = Arc::new(CredentialStore::new(&ctx, backend));
        let credential = credentials
            .declare(
                "db-master",
                "app",
                "admin",
                Password::new("hunter2-secret"),
                RemovalPolicy::Destroy,
            )
            .unwrap();
        let db_sg = NetworkBoundary::new(&ctx, "db-sg");
        let runner_sg = NetworkBoundary::with_all_outbound(&ctx, "runner-sg");
        let cluster = cluster::create(&ctx, test_spec(credential.clone()), &db_sg).unwrap();
        let objects = Arc::new(InMemoryObjectStore::new());
        objects.insert("schema-bucket", "schema.sql", "CREATE TABLE t (id int);");
        Fixture {
            ctx,
            db_sg,
            runner_sg,
            cluster,
            credentials,
            objects,
            credential,
        }
    }

    fn payload() -> PayloadLocation {
        PayloadLocation {
            bucket: "schema-bucket".to_string(),
            code_key: "migration_runner.zip".to_string(),
            schema_key: "schema.sql".to_string(),
        }
    }

    fn job(f: &Fixture) -> MigrationJob {
        let policy = AccessPolicy::for_migration_runner(
            PolicyScope::Narrow,
            &f.ctx,
            &f.credential,
            "schema-bucket",
            &["schema.sql", "migration_runner.zip"],
        );
        MigrationJob::new("initialize-db", payload(), f.credential.clone(), &f.runner_sg, policy)
    }

    fn deps(f: &Fixture, applier: Arc<ScriptedApplier>) -> RunnerDeps {
        RunnerDeps {
            credentials: f.credentials.clone(),
            objects: f.objects.clone(),
            applier,
        }
    }

    fn define_with(
        f: &Fixture,
        job: MigrationJob,
        applier: Arc<ScriptedApplier>,
    ) -> Result<JobHandle> {
        define(&f.ctx, job, &f.cluster, &f.db_sg, &f.runner_sg, deps(f, applier))
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "app-db.cluster.local".to_string(),
            port: 5432,
        }
    }

    #[test]
    fn test_definition_holds_no_password() {
        let f = fixture();
        let text = serde_json::to_string(&job(&f)).unwrap();
        assert!(!text.contains("hunter2-secret"));
        assert!(text.contains(&f.credential.id));
        assert_eq!(job(&f).timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_with_timeout_rounds_up_fractional_seconds() {
        let f = fixture();
        let job = job(&f).with_timeout(Duration::from_millis(500));
        assert_eq!(job.timeout(), Duration::from_secs(1));
        let job = job.with_timeout(Duration::from_millis(90_250));
        assert_eq!(job.timeout(), Duration::from_secs(91));
        let job = job.with_timeout(Duration::from_secs(60));
        assert_eq!(job.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_define_requires_ingress_rule() {
        let f = fixture();
        let applier = Arc::new(ScriptedApplier::default());
        let err = define_with(&f, job(&f), applier.clone()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        f.db_sg.add_ingress(Peer::Boundary("runner-sg".to_string()), 5432, None).unwrap();
        assert!(define_with(&f, job(&f), applier).is_ok());
    }

    #[test]
    fn test_define_rejects_policy_without_schema_access() {
        let f = fixture();
        f.db_sg.add_ingress(f.runner_sg.as_peer(), 5432, None).unwrap();
        let mut job = job(&f);
        job.policy = AccessPolicy::for_migration_runner(
            PolicyScope::Narrow,
            &f.ctx,
            &f.credential,
            "schema-bucket",
            &[],
        );
        let err = define_with(&f, job, Arc::new(ScriptedApplier::default())).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_invoke_resolves_bindings_live() {
        let f = fixture();
        f.db_sg.add_ingress(f.runner_sg.as_peer(), 5432, None).unwrap();
        f.credentials.provision(&f.credential).await.unwrap();
        let applier = Arc::new(ScriptedApplier::default());
        let handle = define_with(&f, job(&f), applier.clone()).unwrap();

        let report = handle.invoke(&endpoint()).await.unwrap();
        assert_eq!(report.schema_bytes, "CREATE TABLE t (id int);".len());
        assert_eq!(applier.calls(), 1);

        let seen = applier.seen.lock().unwrap();
        let (user, env) = &seen[0];
        assert_eq!(user, "admin");
        assert_eq!(env["DB_HOST"], "app-db.cluster.local");
        assert_eq!(env["DB_PORT"], "5432");
        assert_eq!(env["DB_SECRET_REF"], f.credential.id);
        assert!(env.values().all(|v| !v.contains("hunter2")));
    }

    #[tokio::test]
    async fn test_missing_secret_is_credential_resolution_error() {
        let f = fixture();
        f.db_sg.add_ingress(f.runner_sg.as_peer(), 5432, None).unwrap();
        let applier = Arc::new(ScriptedApplier::default());
        let handle = define_with(&f, job(&f), applier.clone()).unwrap();

        let err = handle.invoke(&endpoint()).await.unwrap_err();
        assert!(matches!(err, Error::CredentialResolution(_)));
        assert_eq!(applier.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_schema_is_payload_error() {
        let f = fixture();
        f.db_sg.add_ingress(f.runner_sg.as_peer(), 5432, None).unwrap();
        f.credentials.provision(&f.credential).await.unwrap();
        let mut job = job(&f);
        job.payload.schema_key = "missing.sql".to_string();
        job.policy = AccessPolicy::for_migration_runner(
            PolicyScope::Narrow,
            &f.ctx,
            &f.credential,
            "schema-bucket",
            &["missing.sql"],
        );
        let handle = define_with(&f, job, Arc::new(ScriptedApplier::default())).unwrap();

        assert!(matches!(handle.invoke(&endpoint()).await, Err(Error::Payload(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_runner_times_out_at_bound() {
        let f = fixture();
        f.db_sg.add_ingress(f.runner_sg.as_peer(), 5432, None).unwrap();
        f.credentials.provision(&f.credential).await.unwrap();
        let applier = Arc::new(ScriptedApplier {
            hang: true,
            ..Default::default()
        });
        let handle = define_with(&f, job(&f), applier.clone()).unwrap();

        let started = Instant::now();
        let err = handle.invoke(&endpoint()).await.unwrap_err();
        match err {
            Error::Timeout { job, after } => {
                assert_eq!(job, "initialize-db");
                assert_eq!(after, DEFAULT_TIMEOUT);
            }
            other => panic!("expected timeout, got {other}"),
        }
        assert!(started.elapsed() >= DEFAULT_TIMEOUT);
        assert_eq!(applier.calls(), 1);
    }
}
