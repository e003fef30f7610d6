//! Network boundary
//!
//! A named, append-only set of reachability rules scoped to a virtual
//! network. Rules are keyed by (direction, peer, port); adding the same key
//! twice is a no-op, so additions from unrelated callers commute.

use crate::context::DeploymentContext;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Traffic direction of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// Other side of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Peer {
    /// Another boundary, by name
    Boundary(String),
    /// Opaque externally supplied peer (CIDR, prefix list, ...)
    External(String),
    /// Any IPv4 address
    AnyIpv4,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boundary(name) => write!(f, "boundary:{}", name),
            Self::External(id) => write!(f, "external:{}", id),
            Self::AnyIpv4 => write!(f, "0.0.0.0/0"),
        }
    }
}

/// TCP port in [1, 65535]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(u16);

impl Port {
    pub fn tcp(port: u32) -> Result<Self> {
        match u16::try_from(port) {
            Ok(p) if p >= 1 => Ok(Self(p)),
            _ => Err(Error::validation(format!(
                "port {} outside [1, 65535]",
                port
            ))),
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp/{}", self.0)
    }
}

/// A single reachability rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    pub direction: Direction,
    pub peer: Peer,
    pub port: Port,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared from the peer's side rather than this boundary's owner
    #[serde(default)]
    pub remote: bool,
}

impl NetworkRule {
    fn same_key(&self, direction: Direction, peer: &Peer, port: Port) -> bool {
        self.direction == direction && &self.peer == peer && self.port == port
    }
}

/// Serializable snapshot of a boundary
#[derive(Debug, Clone, Serialize)]
pub struct BoundaryDefinition {
    pub name: String,
    pub vpc_id: String,
    pub allow_all_outbound: bool,
    pub rules: Vec<NetworkRule>,
}

struct Inner {
    name: String,
    vpc_id: String,
    allow_all_outbound: bool,
    rules: Mutex<Vec<NetworkRule>>,
}

/// Shared handle to a boundary; clones see the same rule set
#[derive(Clone)]
pub struct NetworkBoundary {
    inner: Arc<Inner>,
}

impl fmt::Debug for NetworkBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkBoundary")
            .field("name", &self.inner.name)
            .field("rules", &self.rules().len())
            .finish()
    }
}

impl NetworkBoundary {
    /// Create a boundary with no outbound allowance
    pub fn new(ctx: &DeploymentContext, name: impl Into<String>) -> Self {
        Self::build(ctx, name.into(), false)
    }

    /// Create a boundary that may reach anything outbound
    pub fn with_all_outbound(ctx: &DeploymentContext, name: impl Into<String>) -> Self {
        Self::build(ctx, name.into(), true)
    }

    fn build(ctx: &DeploymentContext, name: String, allow_all_outbound: bool) -> Self {
        debug!(boundary = %name, vpc = %ctx.vpc.id, "Declaring boundary");
        Self {
            inner: Arc::new(Inner {
                name,
                vpc_id: ctx.vpc.id.clone(),
                allow_all_outbound,
                rules: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// This boundary as the peer of someone else's rule
    pub fn as_peer(&self) -> Peer {
        Peer::Boundary(self.inner.name.clone())
    }

    /// Allow `peer` to reach this boundary on `port`.
    ///
    /// Returns `false` when an identical rule already existed.
    pub fn add_ingress(&self, peer: Peer, port: u32, description: Option<&str>) -> Result<bool> {
        let port = Port::tcp(port)?;
        Ok(self.push(Direction::Ingress, peer, port, description, false))
    }

    /// Allow this boundary to reach `peer` on `port`.
    pub fn add_egress(&self, peer: Peer, port: u32, description: Option<&str>) -> Result<bool> {
        let port = Port::tcp(port)?;
        Ok(self.push(Direction::Egress, peer, port, description, false))
    }

    /// Declare two-way reachability between `peer` and this boundary.
    ///
    /// Adds ingress on self from `peer` and egress on `peer` to self, both on
    /// `port`. The port is validated before either rule is recorded.
    pub fn add_client(
        &self,
        peer: &NetworkBoundary,
        port: u32,
        description: Option<&str>,
        remote_rule: bool,
    ) -> Result<()> {
        let port = Port::tcp(port)?;
        self.push(Direction::Ingress, peer.as_peer(), port, description, remote_rule);
        peer.push(Direction::Egress, self.as_peer(), port, description, remote_rule);
        info!(boundary = %self.name(), peer = %peer.name(), %port, "Client registered");
        Ok(())
    }

    /// Whether ingress from `peer` on `port` is permitted
    pub fn allows_ingress(&self, peer: &Peer, port: Port) -> bool {
        self.lock().iter().any(|r| {
            r.same_key(Direction::Ingress, peer, port)
                || r.same_key(Direction::Ingress, &Peer::AnyIpv4, port)
        })
    }

    /// Snapshot of the rule set in insertion order
    pub fn rules(&self) -> Vec<NetworkRule> {
        self.lock().clone()
    }

    pub fn definition(&self) -> BoundaryDefinition {
        BoundaryDefinition {
            name: self.inner.name.clone(),
            vpc_id: self.inner.vpc_id.clone(),
            allow_all_outbound: self.inner.allow_all_outbound,
            rules: self.rules(),
        }
    }

    fn push(
        &self,
        direction: Direction,
        peer: Peer,
        port: Port,
        description: Option<&str>,
        remote: bool,
    ) -> bool {
        let mut rules = self.lock();
        if rules.iter().any(|r| r.same_key(direction, &peer, port)) {
            debug!(boundary = %self.name(), ?direction, %peer, %port, "Rule already present");
            return false;
        }
        debug!(boundary = %self.name(), ?direction, %peer, %port, "Rule added");
        rules.push(NetworkRule {
            direction,
            peer,
            port,
            description: description.map(str::to_string),
            remote,
        });
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<NetworkRule>> {
        // Rules are append-only, so a poisoned guard still holds a valid set
        self.inner.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[test]
    fn test_repeated_ingress_is_idempotent() {
        let sg = NetworkBoundary::new(&test_context(), "db-sg");
        let peer = Peer::External("10.0.0.0/16".to_string());

        assert!(sg.add_ingress(peer.clone(), 5432, Some("office")).unwrap());
        assert!(!sg.add_ingress(peer.clone(), 5432, None).unwrap());
        assert!(!sg.add_ingress(peer.clone(), 5432, Some("again")).unwrap());

        let rules = sg.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].description.as_deref(), Some("office"));
    }

    #[test]
    fn test_direction_and_port_are_part_of_the_key() {
        let sg = NetworkBoundary::new(&test_context(), "db-sg");
        let peer = Peer::External("pl-123".to_string());

        sg.add_ingress(peer.clone(), 5432, None).unwrap();
        sg.add_egress(peer.clone(), 5432, None).unwrap();
        sg.add_ingress(peer, 6432, None).unwrap();
        assert_eq!(sg.rules().len(), 3);
    }

    #[test]
    fn test_port_range_is_validated() {
        let sg = NetworkBoundary::new(&test_context(), "db-sg");
        for bad in [0u32, 65536, 70000] {
            let err = sg.add_ingress(Peer::AnyIpv4, bad, None).unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert!(sg.add_egress(Peer::AnyIpv4, 65535, None).unwrap());
        assert!(sg.add_egress(Peer::AnyIpv4, 1, None).unwrap());
    }

    #[test]
    fn test_add_client_declares_both_sides() {
        let ctx = test_context();
        let db = NetworkBoundary::new(&ctx, "db-sg");
        let app = NetworkBoundary::new(&ctx, "app-sg");

        db.add_client(&app, 5432, Some("db"), false).unwrap();
        db.add_client(&app, 5432, Some("db"), false).unwrap();

        let ingress = db.rules();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].direction, Direction::Ingress);
        assert_eq!(ingress[0].peer, Peer::Boundary("app-sg".to_string()));
        assert_eq!(ingress[0].port.get(), 5432);

        let egress = app.rules();
        assert_eq!(egress.len(), 1);
        assert_eq!(egress[0].direction, Direction::Egress);
        assert_eq!(egress[0].peer, Peer::Boundary("db-sg".to_string()));
        assert_eq!(egress[0].port.get(), 5432);
    }

    #[test]
    fn test_add_client_with_bad_port_leaves_both_untouched() {
        let ctx = test_context();
        let db = NetworkBoundary::new(&ctx, "db-sg");
        let app = NetworkBoundary::new(&ctx, "app-sg");

        assert!(db.add_client(&app, 0, None, true).is_err());
        assert!(db.rules().is_empty());
        assert!(app.rules().is_empty());
    }

    #[test]
    fn test_rules_are_shared_between_clones() {
        let db = NetworkBoundary::new(&test_context(), "db-sg");
        let attached = db.clone();
        db.add_ingress(Peer::Boundary("worker-sg".to_string()), 5432, None)
            .unwrap();
        let worker = Peer::Boundary("worker-sg".to_string());
        assert!(attached.allows_ingress(&worker, Port::tcp(5432).unwrap()));
    }

    #[test]
    fn test_concurrent_additions_commute() {
        let db = NetworkBoundary::new(&test_context(), "db-sg");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    db.add_ingress(Peer::External(format!("peer-{}", i % 4)), 5432, None)
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(db.rules().len(), 4);
    }
}
