//! Cluster resource
//!
//! Validates a [`ClusterSpec`], attaches it to one credential and one
//! boundary, and exposes a readiness signal fed by provisioning events.
//! The cluster is ready only once the engine reports it available and every
//! declared instance has come up.

use crate::boundary::{NetworkBoundary, Peer, Port};
use crate::context::{DeploymentContext, SubnetType};
use crate::credentials::CredentialRef;
use crate::error::{Error, Result};
use crate::graph::RemovalPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Database engine and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum EngineKind {
    AuroraPostgres(String),
    AuroraMysql(String),
}

impl EngineKind {
    pub fn default_port(&self) -> u32 {
        match self {
            Self::AuroraPostgres(_) => 5432,
            Self::AuroraMysql(_) => 3306,
        }
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        Self::AuroraPostgres("13.7".to_string())
    }
}

/// Instance class and size, e.g. `r6g` / `large`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub class: String,
    pub size: String,
}

impl InstanceSpec {
    pub fn new(class: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            size: size.into(),
        }
    }

    pub fn instance_type(&self) -> String {
        format!("db.{}.{}", self.class, self.size)
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.class.trim().is_empty() || self.size.trim().is_empty() {
            return Err(Error::validation(format!("{} instance needs a class and a size", role)));
        }
        Ok(())
    }
}

/// Everything needed to declare a cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSpec {
    pub identifier: String,
    pub engine: EngineKind,
    pub writer: Option<InstanceSpec>,
    pub readers: Vec<InstanceSpec>,
    /// Explicit port; the engine default applies when unset
    pub port: Option<u32>,
    pub default_database: String,
    pub credential: CredentialRef,
    pub boundary: String,
    pub subnet_type: SubnetType,
    pub publicly_accessible: bool,
    pub removal_policy: RemovalPolicy,
}

impl ClusterSpec {
    /// Port the cluster listens on
    pub fn resolved_port(&self) -> Result<Port> {
        Port::tcp(self.port.unwrap_or_else(|| self.engine.default_port()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::validation("cluster identifier must not be empty"));
        }
        match &self.writer {
            Some(writer) => writer.validate("writer")?,
            None => return Err(Error::validation("cluster needs a writer instance")),
        }
        for reader in &self.readers {
            reader.validate("reader")?;
        }
        if self.default_database.trim().is_empty() {
            return Err(Error::validation("default database name must not be empty"));
        }
        self.resolved_port()?;
        Ok(())
    }

    fn instance_ids(&self) -> Vec<String> {
        let mut ids = vec![format!("{}-writer", self.identifier)];
        ids.extend((1..=self.readers.len()).map(|n| format!("{}-reader-{}", self.identifier, n)));
        ids
    }
}

/// Cluster network endpoint, known once ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Lifecycle as observed by dependents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterStatus {
    Declared,
    Creating,
    Ready { endpoint: Endpoint },
    Failed { reason: String },
    RolledBack,
}

impl ClusterStatus {
    fn is_settled(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Failed { .. } | Self::RolledBack)
    }
}

/// Event reported by the provisioning engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    CreationStarted,
    InstanceAvailable { instance: String },
    Available { host: String },
    Failed { reason: String },
    RolledBack,
}

/// Serializable declaration of the cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDefinition {
    #[serde(flatten)]
    pub spec: ClusterSpec,
    pub port: Port,
    pub instances: Vec<String>,
    pub vpc_id: String,
}

#[derive(Default)]
struct Progress {
    pending: BTreeSet<String>,
    host: Option<String>,
}

struct Inner {
    id: String,
    definition: ClusterDefinition,
    progress: Mutex<Progress>,
    status: watch::Sender<ClusterStatus>,
}

/// Handle to a declared cluster
#[derive(Clone)]
pub struct ClusterHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Declare a cluster attached to `boundary`.
///
/// With `publicly_accessible` set, an ingress rule from any IPv4 address is
/// opened on the cluster port. That posture is opt-in.
pub fn create(
    ctx: &DeploymentContext,
    spec: ClusterSpec,
    boundary: &NetworkBoundary,
) -> Result<ClusterHandle> {
    spec.validate()?;
    if spec.boundary != boundary.name() {
        return Err(Error::validation(format!(
            "cluster {} references boundary {} but was attached to {}",
            spec.identifier,
            spec.boundary,
            boundary.name()
        )));
    }

    let port = spec.resolved_port()?;
    if spec.publicly_accessible {
        warn!(cluster = %spec.identifier, %port, "Cluster is publicly accessible");
        boundary.add_ingress(Peer::AnyIpv4, u32::from(port.get()), Some("public access"))?;
    }

    let instances = spec.instance_ids();
    let id = format!("cluster:{}", spec.identifier);
    info!(
        cluster = %spec.identifier,
        engine = ?spec.engine,
        instances = instances.len(),
        %port,
        "Cluster declared"
    );

    let (status, _) = watch::channel(ClusterStatus::Declared);
    Ok(ClusterHandle {
        inner: Arc::new(Inner {
            id,
            progress: Mutex::new(Progress::default()),
            definition: ClusterDefinition {
                spec,
                port,
                instances,
                vpc_id: ctx.vpc.id.clone(),
            },
            status,
        }),
    })
}

impl ClusterHandle {
    /// Graph node id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn port(&self) -> Port {
        self.inner.definition.port
    }

    pub fn instance_ids(&self) -> &[String] {
        &self.inner.definition.instances
    }

    pub fn credential(&self) -> &CredentialRef {
        &self.inner.definition.spec.credential
    }

    pub fn definition(&self) -> &ClusterDefinition {
        &self.inner.definition
    }

    pub fn status(&self) -> ClusterStatus {
        self.inner.status.borrow().clone()
    }

    /// Readiness signal; the current value is visible immediately
    pub fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.inner.status.subscribe()
    }

    /// Feed a provisioning event into the readiness state.
    ///
    /// Events arriving after the status settled are ignored, except a
    /// rollback of a failed cluster.
    pub fn report(&self, event: ClusterEvent) {
        let mut progress = self.inner.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.status();

        let next = match (&current, event) {
            (ClusterStatus::Declared, ClusterEvent::CreationStarted) => {
                progress.pending = self.instance_ids().iter().cloned().collect();
                Some(ClusterStatus::Creating)
            }
            (ClusterStatus::Creating, ClusterEvent::InstanceAvailable { instance }) => {
                progress.pending.remove(&instance);
                self.ready_if_complete(&progress)
            }
            (ClusterStatus::Creating, ClusterEvent::Available { host }) => {
                progress.host = Some(host);
                self.ready_if_complete(&progress)
            }
            (
                ClusterStatus::Declared | ClusterStatus::Creating,
                ClusterEvent::Failed { reason },
            ) => {
                error!(cluster = %self.id(), %reason, "Cluster provisioning failed");
                Some(ClusterStatus::Failed { reason })
            }
            (
                ClusterStatus::Declared | ClusterStatus::Creating | ClusterStatus::Failed { .. },
                ClusterEvent::RolledBack,
            ) => {
                warn!(cluster = %self.id(), "Cluster creation rolled back");
                Some(ClusterStatus::RolledBack)
            }
            (status, event) => {
                if status.is_settled() {
                    warn!(cluster = %self.id(), ?event, "Ignoring event for settled cluster");
                }
                None
            }
        };

        if let Some(next) = next {
            if let ClusterStatus::Ready { endpoint } = &next {
                info!(cluster = %self.id(), %endpoint, "Cluster ready");
            }
            self.inner.status.send_replace(next);
        }
    }

    fn ready_if_complete(&self, progress: &Progress) -> Option<ClusterStatus> {
        match &progress.host {
            Some(host) if progress.pending.is_empty() => Some(ClusterStatus::Ready {
                endpoint: Endpoint {
                    host: host.clone(),
                    port: self.port().get(),
                },
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_spec(credential: CredentialRef) -> ClusterSpec {
    ClusterSpec {
        identifier: "app-db".to_string(),
        engine: EngineKind::default(),
        writer: Some(InstanceSpec::new("r6g", "large")),
        readers: Vec::new(),
        port: None,
        default_database: "app".to_string(),
        credential,
        boundary: "db-sg".to_string(),
        subnet_type: SubnetType::Private,
        publicly_accessible: false,
        removal_policy: RemovalPolicy::Destroy,
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

    fn declare(spec: ClusterSpec) -> (NetworkBoundary, Result<ClusterHandle>) {
        let ctx = test_context();
        let sg = NetworkBoundary::new(&ctx, "db-sg");
        let handle = create(&ctx, spec, &sg);
        (sg, handle)
    }

    #[test]
    fn test_validation_failures() {
        let mut spec = test_spec(credential());
        spec.writer = None;
        assert!(matches!(declare(spec).1, Err(Error::Validation(_))));

        let mut spec = test_spec(credential());
        spec.default_database = " ".to_string();
        assert!(matches!(declare(spec).1, Err(Error::Validation(_))));

        let mut spec = test_spec(credential());
        spec.port = Some(0);
        assert!(matches!(declare(spec).1, Err(Error::Validation(_))));

        let mut spec = test_spec(credential());
        spec.boundary = "other-sg".to_string();
        assert!(matches!(declare(spec).1, Err(Error::Validation(_))));
    }

    #[test]
    fn test_port_defaults_to_engine() {
        let (_, handle) = declare(test_spec(credential()));
        assert_eq!(handle.unwrap().port().get(), 5432);

        let mut spec = test_spec(credential());
        spec.engine = EngineKind::AuroraMysql("8.0".to_string());
        assert_eq!(spec.resolved_port().unwrap().get(), 3306);
        spec.port = Some(6432);
        assert_eq!(spec.resolved_port().unwrap().get(), 6432);
    }

    #[test]
    fn test_public_access_is_opt_in() {
        let (sg, _) = declare(test_spec(credential()));
        assert!(sg.rules().is_empty());

        let mut spec = test_spec(credential());
        spec.publicly_accessible = true;
        let (sg, handle) = declare(spec);
        let handle = handle.unwrap();
        let rules = sg.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].peer, Peer::AnyIpv4);
        assert_eq!(rules[0].port, handle.port());
    }

    #[test]
    fn test_ready_waits_for_every_instance() {
        let mut spec = test_spec(credential());
        spec.readers = vec![InstanceSpec::new("r6g", "large")];
        let (_, handle) = declare(spec);
        let handle = handle.unwrap();
        assert_eq!(handle.instance_ids().len(), 2);

        handle.report(ClusterEvent::CreationStarted);
        handle.report(ClusterEvent::Available {
            host: "app-db.cluster.local".to_string(),
        });
        assert_eq!(handle.status(), ClusterStatus::Creating);

        handle.report(ClusterEvent::InstanceAvailable {
            instance: "app-db-writer".to_string(),
        });
        assert_eq!(handle.status(), ClusterStatus::Creating);

        handle.report(ClusterEvent::InstanceAvailable {
            instance: "app-db-reader-1".to_string(),
        });
        assert_eq!(
            handle.status(),
            ClusterStatus::Ready {
                endpoint: Endpoint {
                    host: "app-db.cluster.local".to_string(),
                    port: 5432,
                }
            }
        );
    }

    #[test]
    fn test_events_before_creation_are_ignored() {
        let (_, handle) = declare(test_spec(credential()));
        let handle = handle.unwrap();
        handle.report(ClusterEvent::Available {
            host: "early".to_string(),
        });
        assert_eq!(handle.status(), ClusterStatus::Declared);
    }

    #[test]
    fn test_failed_cluster_never_becomes_ready() {
        let (_, handle) = declare(test_spec(credential()));
        let handle = handle.unwrap();
        handle.report(ClusterEvent::CreationStarted);
        handle.report(ClusterEvent::Failed {
            reason: "insufficient capacity".to_string(),
        });
        handle.report(ClusterEvent::InstanceAvailable {
            instance: "app-db-writer".to_string(),
        });
        handle.report(ClusterEvent::Available {
            host: "late".to_string(),
        });
        assert!(matches!(handle.status(), ClusterStatus::Failed { .. }));

        handle.report(ClusterEvent::RolledBack);
        assert_eq!(handle.status(), ClusterStatus::RolledBack);
    }
}
