//! Database provisioning facade
//!
//! Declares the credential, the cluster boundary, the cluster, the
//! migration runner and its post-ready trigger as one graph. Nothing leaves
//! this constructor until every declaration validated, so a malformed
//! input never yields a partially built graph.

use crate::boundary::NetworkBoundary;
use crate::cluster::{self, ClusterEvent, ClusterHandle, ClusterSpec};
use crate::config::{RdsConfig, StackOptions};
use crate::context::DeploymentContext;
use crate::credentials::{CredentialRef, CredentialStore, SecretBackend};
use crate::engine::{ApplyReport, ProvisioningEngine};
use crate::error::{Error, Result};
use crate::graph::{Relation, ResourceGraph, ResourceKind, ResourceNode, TeardownStep};
use crate::migration::{
    self, JobHandle, MigrationJob, ObjectStore, PayloadLocation, RunnerDeps, SchemaApplier,
};
use crate::policy::AccessPolicy;
use crate::trigger::{PostReadyTrigger, TriggerDefinition};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const MIGRATION_JOB_NAME: &str = "initialize-db";

/// External collaborators the stack talks to
#[derive(Clone)]
pub struct Collaborators {
    pub secrets: Arc<dyn SecretBackend>,
    pub objects: Arc<dyn ObjectStore>,
    pub applier: Arc<dyn SchemaApplier>,
}

/// A managed database cluster with its boundary, credential and one-shot
/// migration
pub struct DatabaseStack {
    ctx: DeploymentContext,
    graph: ResourceGraph,
    credentials: Arc<CredentialStore>,
    credential: CredentialRef,
    credential_node: String,
    boundary: NetworkBoundary,
    runner_boundary: NetworkBoundary,
    cluster: ClusterHandle,
    job: JobHandle,
    trigger: PostReadyTrigger,
    gated: Vec<ResourceNode>,
}

fn boundary_node(boundary: &NetworkBoundary) -> String {
    format!("boundary:{}", boundary.name())
}

impl DatabaseStack {
    #[instrument(skip_all, fields(stack = %ctx.stack_name))]
    pub fn new(
        ctx: &DeploymentContext,
        config: &RdsConfig,
        options: StackOptions,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        options.validate()?;

        let credentials = Arc::new(CredentialStore::new(ctx, collaborators.secrets));
        let credential = credentials.declare(
            &options.secret_name,
            &options.database_name,
            &config.db_user,
            config.password.clone(),
            options.credential_removal,
        )?;

        let boundary = NetworkBoundary::new(ctx, format!("{}-db-sg", ctx.stack_name));
        let runner_boundary =
            NetworkBoundary::with_all_outbound(ctx, format!("{}-migration-sg", ctx.stack_name));

        let cluster = cluster::create(
            ctx,
            ClusterSpec {
                identifier: options.cluster_identifier.clone(),
                engine: options.engine.clone(),
                writer: Some(config.writer()),
                readers: config.reader().into_iter().collect(),
                port: Some(config.port),
                default_database: options.database_name.clone(),
                credential: credential.clone(),
                boundary: boundary.name().to_string(),
                subnet_type: ctx.vpc.subnet_type,
                publicly_accessible: options.publicly_accessible,
                removal_policy: options.cluster_removal,
            },
            &boundary,
        )?;
        credentials.grant_read(&credential, cluster.id())?;

        // Must exist before the job is defined
        boundary.add_ingress(
            runner_boundary.as_peer(),
            u32::from(cluster.port().get()),
            Some("migration runner"),
        )?;

        let payload = PayloadLocation {
            bucket: options.schema_bucket.clone(),
            code_key: options.code_key.clone(),
            schema_key: options.schema_key.clone(),
        };
        let policy = AccessPolicy::for_migration_runner(
            options.policy_scope,
            ctx,
            &credential,
            &payload.bucket,
            &[&payload.code_key, &payload.schema_key],
        );
        let job = MigrationJob::new(
            MIGRATION_JOB_NAME,
            payload,
            credential.clone(),
            &runner_boundary,
            policy,
        )
        .with_timeout(options.migration_timeout);
        let job = migration::define(
            ctx,
            job,
            &cluster,
            &boundary,
            &runner_boundary,
            RunnerDeps {
                credentials: credentials.clone(),
                objects: collaborators.objects,
                applier: collaborators.applier,
            },
        )?;

        let definition = options.gated_resources.iter().fold(
            TriggerDefinition::after(format!("trigger:{}", MIGRATION_JOB_NAME), &job, &cluster)
                .invocation_type(options.invocation_type),
            |definition, gated| definition.execute_before(&gated.id),
        );
        let trigger = PostReadyTrigger::new(definition, job.clone(), &cluster);

        let mut stack = Self {
            ctx: ctx.clone(),
            graph: ResourceGraph::new(),
            credentials,
            credential_node: format!("credential:{}", credential.name),
            credential,
            boundary,
            runner_boundary,
            cluster,
            job,
            trigger,
            gated: options.gated_resources,
        };
        stack.graph = stack.build_graph()?;

        info!(resources = stack.graph.len(), "Database stack declared");
        Ok(stack)
    }

    fn build_graph(&self) -> Result<ResourceGraph> {
        let mut graph = ResourceGraph::new();
        let credential_definition =
            self.credentials.definition(&self.credential).ok_or_else(|| {
                Error::graph(format!("credential {} vanished", self.credential.name))
            })?;

        graph.add_node(
            ResourceNode::new(
                &self.credential_node,
                ResourceKind::Credential,
                serde_json::to_value(&credential_definition)?,
            )
            .with_removal_policy(credential_definition.removal_policy),
        )?;
        for boundary in [&self.boundary, &self.runner_boundary] {
            graph.add_node(ResourceNode::new(
                boundary_node(boundary),
                ResourceKind::Boundary,
                serde_json::to_value(boundary.definition())?,
            ))?;
        }
        let cluster_definition = self.cluster.definition();
        graph.add_node(
            ResourceNode::new(
                self.cluster.id(),
                ResourceKind::Cluster,
                serde_json::to_value(cluster_definition)?,
            )
            .with_removal_policy(cluster_definition.spec.removal_policy),
        )?;
        graph.add_node(ResourceNode::new(
            self.job.id(),
            ResourceKind::MigrationJob,
            serde_json::to_value(self.job.definition())?,
        ))?;
        graph.add_node(ResourceNode::new(
            self.trigger.id(),
            ResourceKind::Trigger,
            serde_json::to_value(self.trigger.definition())?,
        ))?;
        for gated in &self.gated {
            graph.add_node(gated.clone())?;
        }

        let db_boundary = boundary_node(&self.boundary);
        let runner_boundary = boundary_node(&self.runner_boundary);
        graph.add_edge(self.cluster.id(), &self.credential_node, Relation::DependsOn)?;
        graph.add_edge(self.cluster.id(), &db_boundary, Relation::DependsOn)?;
        graph.add_edge(self.job.id(), &self.credential_node, Relation::DependsOn)?;
        graph.add_edge(self.job.id(), &runner_boundary, Relation::DependsOn)?;
        graph.add_edge(self.job.id(), &db_boundary, Relation::DependsOn)?;
        graph.add_edge(self.trigger.id(), self.job.id(), Relation::DependsOn)?;
        graph.add_edge(self.trigger.id(), self.cluster.id(), Relation::FiresAfter)?;
        for later in &self.trigger.definition().execute_before {
            graph.add_edge(later, self.trigger.id(), Relation::DependsOn)?;
        }
        Ok(graph)
    }

    /// Let `peer` reach the database port-wise, declaring both sides
    pub fn add_client(
        &self,
        peer: &NetworkBoundary,
        port: u32,
        description: Option<&str>,
        remote_rule: bool,
    ) -> Result<()> {
        self.boundary.add_client(peer, port, description, remote_rule)
    }

    pub fn context(&self) -> &DeploymentContext {
        &self.ctx
    }

    /// Boundary the cluster is attached to
    pub fn boundary(&self) -> &NetworkBoundary {
        &self.boundary
    }

    pub fn runner_boundary(&self) -> &NetworkBoundary {
        &self.runner_boundary
    }

    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    pub fn trigger(&self) -> &PostReadyTrigger {
        &self.trigger
    }

    pub fn credential(&self) -> &CredentialRef {
        &self.credential
    }

    /// Graph with boundary definitions refreshed to their current rules
    pub fn snapshot(&self) -> Result<ResourceGraph> {
        let mut graph = self.graph.clone();
        for boundary in [&self.boundary, &self.runner_boundary] {
            let definition = serde_json::to_value(boundary.definition())?;
            graph.update_definition(&boundary_node(boundary), definition)?;
        }
        Ok(graph)
    }

    /// Dependency-ordered plan document
    pub fn plan(&self) -> Result<Value> {
        self.snapshot()?.to_plan()
    }

    /// Teardown order; a retained credential outlives the cluster
    pub fn teardown_plan(&self) -> Result<Vec<TeardownStep>> {
        self.snapshot()?.teardown_order()
    }

    /// Realize the graph through `engine`, dependencies first.
    ///
    /// A failed resource blocks its dependents; resources already realized
    /// stay in place. A trigger whose upstream failed is still run so the
    /// failure is reported against it instead of being skipped silently.
    /// A failed migration is contained: it never tears anything down, and
    /// only blocks resources gated on the trigger when the trigger waits on
    /// the job outcome.
    #[instrument(skip_all, fields(stack = %self.ctx.stack_name))]
    pub async fn apply(&self, engine: &dyn ProvisioningEngine) -> Result<ApplyReport> {
        let graph = self.snapshot()?;
        let mut report = ApplyReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for id in graph.topological_order()? {
            let node = graph
                .node(&id)
                .ok_or_else(|| Error::graph(format!("unknown resource {}", id)))?;

            let waiting_on: Vec<String> = graph
                .dependencies_of(&id)?
                .into_iter()
                .filter(|(dep, relation)| {
                    blocked.contains(dep)
                        && !(node.kind == ResourceKind::Trigger
                            && *relation == Relation::FiresAfter)
                })
                .map(|(dep, _)| dep)
                .collect();
            if !waiting_on.is_empty() {
                warn!(resource = %id, ?waiting_on, "Skipping resource");
                report.skipped.push(id.clone());
                blocked.insert(id);
                continue;
            }

            let outcome = match node.kind {
                ResourceKind::Credential if id == self.credential_node => {
                    match engine.realize(node).await {
                        Ok(_) => self.credentials.provision(&self.credential).await,
                        Err(e) => Err(e),
                    }
                }
                ResourceKind::Cluster if id == self.cluster.id() => {
                    self.realize_cluster(engine, node).await
                }
                ResourceKind::Trigger if id == self.trigger.id() => {
                    let outcome = self.trigger.run().await;
                    if outcome.is_ok() || self.trigger.state().is_terminal() {
                        report.triggers.insert(id.clone(), self.trigger.state());
                    }
                    outcome.map(|_| ())
                }
                _ => engine.realize(node).await.map(|_| ()),
            };

            match outcome {
                Ok(()) => {
                    info!(resource = %id, "Resource realized");
                    report.realized.push(id);
                }
                Err(e) => {
                    let dependents = graph.dependents_of(&id)?;
                    if e.is_contained() {
                        warn!(
                            resource = %id,
                            error = %e,
                            ?dependents,
                            "Migration failed, infrastructure left in place"
                        );
                    } else {
                        error!(resource = %id, error = %e, ?dependents, "Resource failed");
                    }
                    report.failed.push((id.clone(), e.to_string()));
                    blocked.insert(id);
                }
            }
        }

        info!(
            realized = report.realized.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Apply finished"
        );
        Ok(report)
    }

    async fn realize_cluster(
        &self,
        engine: &dyn ProvisioningEngine,
        node: &ResourceNode,
    ) -> Result<()> {
        self.cluster.report(ClusterEvent::CreationStarted);
        // Armed for as long as the engine is creating the cluster
        self.trigger.observe_upstream();

        let host = match engine.realize(node).await {
            Ok(realized) => realized.endpoint_host.ok_or_else(|| {
                Error::provisioning(self.cluster.id(), "engine returned no endpoint")
            }),
            Err(e) => Err(e),
        };

        match host {
            Ok(host) => {
                for instance in self.cluster.instance_ids() {
                    self.cluster.report(ClusterEvent::InstanceAvailable {
                        instance: instance.clone(),
                    });
                }
                self.cluster.report(ClusterEvent::Available { host });
                Ok(())
            }
            Err(e) => {
                self.cluster.report(ClusterEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}
