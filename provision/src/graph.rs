//! Declaration graph
//!
//! Nodes are resource definitions, edges point from a dependency to the
//! resource that needs it. The apply phase walks the graph in topological
//! order, so declaration is fully decoupled from execution.

use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;

/// Kind of declared resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Credential,
    Boundary,
    Cluster,
    MigrationJob,
    Trigger,
    /// Declared by a consumer of the stack, such as an application service
    External,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Credential => "credential",
            Self::Boundary => "boundary",
            Self::Cluster => "cluster",
            Self::MigrationJob => "migration_job",
            Self::Trigger => "trigger",
            Self::External => "external",
        };
        write!(f, "{}", name)
    }
}

/// What happens to a resource when the stack is torn down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    Retain,
}

/// Relation carried by an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Dependent needs the dependency to exist first
    DependsOn,
    /// Dependent fires only after the dependency reports ready
    FiresAfter,
}

/// A declared resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    pub id: String,
    pub kind: ResourceKind,
    pub removal_policy: RemovalPolicy,
    pub definition: Value,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, kind: ResourceKind, definition: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            removal_policy: RemovalPolicy::Destroy,
            definition,
        }
    }

    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }
}

/// One step of a teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownStep {
    pub id: String,
    pub kind: ResourceKind,
    pub policy: RemovalPolicy,
}

/// Dependency graph of resource declarations
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    graph: DiGraph<ResourceNode, Relation>,
    indices: HashMap<String, NodeIndex>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; ids must be unique
    pub fn add_node(&mut self, node: ResourceNode) -> Result<()> {
        if self.indices.contains_key(&node.id) {
            return Err(Error::graph(format!("resource {} declared twice", node.id)));
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.indices.insert(id, idx);
        Ok(())
    }

    /// Declare that `dependent` relates to `dependency`
    pub fn add_edge(
        &mut self,
        dependent: &str,
        dependency: &str,
        relation: Relation,
    ) -> Result<()> {
        let from = self.index(dependency)?;
        let to = self.index(dependent)?;

        if from == to || has_path_connecting(&self.graph, to, from, None) {
            return Err(Error::graph(format!(
                "edge {} -> {} would create a cycle",
                dependent, dependency
            )));
        }

        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, relation);
        }
        Ok(())
    }

    /// Replace the definition payload of an existing node
    pub fn update_definition(&mut self, id: &str, definition: Value) -> Result<()> {
        let idx = self.index(id)?;
        self.graph[idx].definition = definition;
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.indices.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Ids of everything `id` relates to, with the relation
    pub fn dependencies_of(&self, id: &str) -> Result<Vec<(String, Relation)>> {
        let idx = self.index(id)?;
        let mut deps: Vec<_> = self
            .graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .map(|e| (self.graph[e.source()].id.clone(), *e.weight()))
            .collect();
        deps.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(deps)
    }

    /// Ids of everything that relates to `id`
    pub fn dependents_of(&self, id: &str) -> Result<Vec<String>> {
        let idx = self.index(id)?;
        let mut ids: Vec<_> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Node ids ordered so every dependency precedes its dependents
    pub fn topological_order(&self) -> Result<Vec<String>> {
        match toposort(&self.graph, None) {
            Ok(indices) => Ok(indices
                .into_iter()
                .map(|idx| self.graph[idx].id.clone())
                .collect()),
            Err(cycle) => Err(Error::graph(format!(
                "cycle detected involving {}",
                self.graph[cycle.node_id()].id
            ))),
        }
    }

    /// Ordered plan document: one entry per resource, dependencies first
    pub fn to_plan(&self) -> Result<Value> {
        let mut resources = Vec::with_capacity(self.len());
        for id in self.topological_order()? {
            let node = &self.graph[self.index(&id)?];
            let (depends_on, fires_after): (Vec<_>, Vec<_>) = self
                .dependencies_of(&id)?
                .into_iter()
                .partition(|(_, rel)| *rel == Relation::DependsOn);

            resources.push(json!({
                "id": node.id,
                "kind": node.kind,
                "removal_policy": node.removal_policy,
                "depends_on": depends_on.into_iter().map(|(d, _)| d).collect::<Vec<_>>(),
                "fires_after": fires_after.into_iter().map(|(d, _)| d).collect::<Vec<_>>(),
                "definition": node.definition,
            }));
        }
        Ok(json!({ "resources": resources }))
    }

    /// Reverse dependency order with each node's removal policy
    pub fn teardown_order(&self) -> Result<Vec<TeardownStep>> {
        let mut order = self.topological_order()?;
        order.reverse();
        order
            .into_iter()
            .map(|id| {
                let node = &self.graph[self.index(&id)?];
                Ok(TeardownStep {
                    id,
                    kind: node.kind,
                    policy: node.removal_policy,
                })
            })
            .collect()
    }

    fn index(&self, id: &str) -> Result<NodeIndex> {
        self.indices
            .get(id)
            .copied()
            .ok_or_else(|| Error::graph(format!("unknown resource {}", id)))
    }
}
