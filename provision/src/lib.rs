//! Declarative provisioning of a managed database cluster
//!
//! A [`DatabaseStack`] declares a master credential, a network boundary, the
//! cluster itself and a migration runner that is fired exactly once after the
//! cluster reports ready. Declarations form a [`ResourceGraph`] which can be
//! rendered as a plan or realized through a [`ProvisioningEngine`].

pub mod boundary;
pub mod cluster;
pub mod config;
pub mod context;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod facade;
pub mod graph;
pub mod migration;
pub mod policy;
pub mod trigger;

pub use boundary::{Direction, NetworkBoundary, NetworkRule, Peer, Port};
pub use cluster::{
    ClusterEvent, ClusterHandle, ClusterSpec, ClusterStatus, Endpoint, EngineKind, InstanceSpec,
};
pub use config::{RdsConfig, StackOptions};
pub use context::{DeploymentContext, SubnetType, VpcRef};
pub use credentials::{
    Credential, CredentialRef, CredentialStore, FileSecretBackend, InMemorySecretBackend, Password,
    SecretBackend, SecretMaterial,
};
pub use engine::{ApplyReport, ProvisioningEngine, Realized};
pub use error::{Error, Result};
pub use facade::{Collaborators, DatabaseStack};
pub use graph::{Relation, RemovalPolicy, ResourceGraph, ResourceKind, ResourceNode, TeardownStep};
pub use migration::{
    DirObjectStore, InMemoryObjectStore, JobHandle, JobReport, MigrationJob, MigrationTarget,
    ObjectStore, PayloadLocation, PsqlApplier, SchemaApplier,
};
pub use policy::{AccessPolicy, PolicyScope};
pub use trigger::{InvocationType, PostReadyTrigger, TriggerDefinition, TriggerState};
