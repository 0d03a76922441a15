//! Topology store contract and in-memory implementation.

use super::{FailureBudget, ServiceError};
use crate::model::{ExternalNetwork, PrimaryAssignment, Router, TunnelEndpoint};
use async_trait::async_trait;
use napt_types::{NodeId, RouterId, Vni};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Read access to routers, membership and tunnel state, plus the one record
/// this control plane owns: the [`PrimaryAssignment`].
#[async_trait]
pub trait TopologyStore: Send + Sync {
    fn router(&self, name: &str) -> Option<Router>;

    fn router_by_id(&self, id: RouterId) -> Option<Router>;

    /// Resolves the router owning a shared routing domain carried in packet
    /// metadata in place of a router id.
    fn router_by_domain(&self, domain: RouterId) -> Option<Router>;

    fn routers(&self) -> Vec<Router>;

    fn external_network(&self, id: &Uuid) -> Option<ExternalNetwork>;

    /// Nodes with at least one interface of the router.
    fn nodes_hosting(&self, router: &str) -> BTreeSet<NodeId>;

    fn routers_on_node(&self, node: NodeId) -> Vec<String>;

    /// A node without a tunnel endpoint is unhealthy.
    fn tunnel_endpoint(&self, node: NodeId) -> Option<TunnelEndpoint>;

    /// VNI already provisioned for a VPN instance, if any.
    fn provisioned_vni(&self, vpn: &str) -> Option<Vni>;

    fn primary(&self, router: &str) -> Option<PrimaryAssignment>;

    fn primaries(&self) -> Vec<PrimaryAssignment>;

    async fn put_primary(&self, assignment: PrimaryAssignment) -> Result<(), ServiceError>;

    async fn delete_primary(&self, router: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct TopologyState {
    routers: BTreeMap<String, Router>,
    domains: HashMap<RouterId, String>,
    networks: HashMap<Uuid, ExternalNetwork>,
    hosting: BTreeMap<String, BTreeSet<NodeId>>,
    teps: BTreeMap<NodeId, TunnelEndpoint>,
    vnis: HashMap<String, Vni>,
    primaries: BTreeMap<String, PrimaryAssignment>,
}

/// Topology held in process; mutated directly by tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryTopology {
    state: RwLock<TopologyState>,
    write_failures: FailureBudget,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, TopologyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TopologyState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_network(&self, network: ExternalNetwork) {
        self.write().networks.insert(network.id, network);
    }

    pub fn add_router(&self, router: Router) {
        self.write().routers.insert(router.name.clone(), router);
    }

    pub fn remove_router(&self, name: &str) -> Option<Router> {
        let mut state = self.write();
        state.hosting.remove(name);
        state.domains.retain(|_, owner| owner != name);
        state.routers.remove(name)
    }

    /// Binds a shared routing domain id to its owning router.
    pub fn add_domain(&self, domain: RouterId, router: &str) {
        self.write().domains.insert(domain, router.to_string());
    }

    pub fn host_router(&self, router: &str, node: NodeId) {
        self.write()
            .hosting
            .entry(router.to_string())
            .or_default()
            .insert(node);
    }

    pub fn unhost_router(&self, router: &str, node: NodeId) {
        let mut state = self.write();
        if let Some(nodes) = state.hosting.get_mut(router) {
            nodes.remove(&node);
            if nodes.is_empty() {
                state.hosting.remove(router);
            }
        }
    }

    pub fn set_tunnel_endpoint(&self, node: NodeId, ip: Ipv4Addr) {
        self.write().teps.insert(node, TunnelEndpoint { node, ip });
    }

    pub fn remove_tunnel_endpoint(&self, node: NodeId) {
        self.write().teps.remove(&node);
    }

    pub fn set_vni(&self, vpn: &str, vni: Vni) {
        self.write().vnis.insert(vpn.to_string(), vni);
    }

    /// Seeds an assignment without going through election.
    pub fn set_primary(&self, router: &str, node: NodeId) {
        self.write()
            .primaries
            .insert(router.to_string(), PrimaryAssignment::new(router, node));
    }

    /// Fails the next `count` assignment writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.write_failures.arm(count);
    }
}

#[async_trait]
impl TopologyStore for MemoryTopology {
    fn router(&self, name: &str) -> Option<Router> {
        self.read().routers.get(name).cloned()
    }

    fn router_by_id(&self, id: RouterId) -> Option<Router> {
        self.read().routers.values().find(|r| r.id == id).cloned()
    }

    fn router_by_domain(&self, domain: RouterId) -> Option<Router> {
        let state = self.read();
        state
            .domains
            .get(&domain)
            .and_then(|name| state.routers.get(name))
            .cloned()
    }

    fn routers(&self) -> Vec<Router> {
        self.read().routers.values().cloned().collect()
    }

    fn external_network(&self, id: &Uuid) -> Option<ExternalNetwork> {
        self.read().networks.get(id).cloned()
    }

    fn nodes_hosting(&self, router: &str) -> BTreeSet<NodeId> {
        self.read().hosting.get(router).cloned().unwrap_or_default()
    }

    fn routers_on_node(&self, node: NodeId) -> Vec<String> {
        self.read()
            .hosting
            .iter()
            .filter(|(_, nodes)| nodes.contains(&node))
            .map(|(router, _)| router.clone())
            .collect()
    }

    fn tunnel_endpoint(&self, node: NodeId) -> Option<TunnelEndpoint> {
        self.read().teps.get(&node).copied()
    }

    fn provisioned_vni(&self, vpn: &str) -> Option<Vni> {
        self.read().vnis.get(vpn).copied()
    }

    fn primary(&self, router: &str) -> Option<PrimaryAssignment> {
        self.read().primaries.get(router).cloned()
    }

    fn primaries(&self) -> Vec<PrimaryAssignment> {
        self.read().primaries.values().cloned().collect()
    }

    async fn put_primary(&self, assignment: PrimaryAssignment) -> Result<(), ServiceError> {
        self.write_failures.check("primary assignment")?;
        self.write()
            .primaries
            .insert(assignment.router.clone(), assignment);
        Ok(())
    }

    async fn delete_primary(&self, router: &str) -> Result<(), ServiceError> {
        self.write_failures.check("primary assignment")?;
        self.write().primaries.remove(router);
        Ok(())
    }
}
