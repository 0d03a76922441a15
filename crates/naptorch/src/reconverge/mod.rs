//! Reconvergence after hosting or tunnel endpoint changes.
//!
//! Every event is turned into work on a per-router queue, so two events for
//! the same router never interleave. Tunnel endpoint events are first
//! serialized per node and then fanned out to the routers that node hosts.

mod routes;

pub use routes::{RouteLedger, LABEL_POOL};

use crate::config::NaptConfig;
use crate::election::PrimarySwitchElector;
use crate::flows::TranslationFlowProgrammer;
use crate::model::Router;
use crate::pool::AddressPoolManager;
use crate::services::TopologyStore;
use crate::stats::NaptStats;
use async_trait::async_trait;
use dashmap::DashMap;
use napt_orch_common::{KeyedWorkQueue, Orch, TaskError, TaskResult, Ticket};
use napt_types::NodeId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SOURCE: &str = "ReconvergenceCoordinator";

/// Role a node currently holds for a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug, Clone)]
enum RouterJob {
    Hosted { node: NodeId, added: bool },
    TunnelEndpoint { node: NodeId, added: bool },
    Removed(Router),
    Reconcile,
}

impl fmt::Display for RouterJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterJob::Hosted { node, added: true } => write!(f, "hosted on {node}"),
            RouterJob::Hosted { node, added: false } => write!(f, "unhosted from {node}"),
            RouterJob::TunnelEndpoint { node, added: true } => write!(f, "tep up on {node}"),
            RouterJob::TunnelEndpoint { node, added: false } => write!(f, "tep down on {node}"),
            RouterJob::Removed(_) => f.write_str("removed"),
            RouterJob::Reconcile => f.write_str("reconcile"),
        }
    }
}

struct Coordinator {
    topology: Arc<dyn TopologyStore>,
    elector: Arc<PrimarySwitchElector>,
    flows: Arc<TranslationFlowProgrammer>,
    pools: Arc<AddressPoolManager>,
    routes: RouteLedger,
    stats: Arc<NaptStats>,
    roles: DashMap<String, BTreeMap<NodeId, Role>>,
    /// Primary the last complete `apply_roles` programmed, per router
    programmed: DashMap<String, NodeId>,
    routers: KeyedWorkQueue<String>,
}

pub struct ReconvergenceCoordinator {
    inner: Arc<Coordinator>,
    nodes: KeyedWorkQueue<NodeId>,
    reconcile_interval: Option<Duration>,
    last_reconcile: Mutex<Instant>,
}

impl ReconvergenceCoordinator {
    pub fn new(
        topology: Arc<dyn TopologyStore>,
        elector: Arc<PrimarySwitchElector>,
        flows: Arc<TranslationFlowProgrammer>,
        pools: Arc<AddressPoolManager>,
        routes: RouteLedger,
        stats: Arc<NaptStats>,
        config: &NaptConfig,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            inner: Arc::new(Coordinator {
                topology,
                elector,
                flows,
                pools,
                routes,
                stats,
                roles: DashMap::new(),
                programmed: DashMap::new(),
                routers: KeyedWorkQueue::new("router", config.queue.router_workers, retry.clone()),
            }),
            nodes: KeyedWorkQueue::new("node", config.queue.node_workers, retry),
            reconcile_interval: config.reconcile_interval(),
            last_reconcile: Mutex::new(Instant::now()),
        }
    }

    /// Router `router` was added to or removed from `node`'s hosting set.
    ///
    /// The topology store must already reflect the change.
    pub fn on_router_hosted_on_node(&self, router: &str, node: NodeId, added: bool) -> Ticket {
        self.inner
            .submit(router.to_string(), RouterJob::Hosted { node, added })
    }

    /// `node`'s tunnel endpoint appeared or disappeared.
    pub fn on_tunnel_endpoint(&self, node: NodeId, added: bool) -> Ticket {
        let inner = Arc::clone(&self.inner);
        let label = if added { "tep up" } else { "tep down" };
        self.nodes.submit(node, label, move || {
            let inner = Arc::clone(&inner);
            async move { inner.fan_out_tunnel_endpoint(node, added).await }
        })
    }

    /// Tears down everything held for a router that left the topology.
    pub fn on_router_removed(&self, router: Router) -> Ticket {
        self.inner
            .submit(router.name.clone(), RouterJob::Removed(router))
    }

    /// Re-applies the expected roles of one router.
    pub fn reconcile(&self, router: &str) -> Ticket {
        self.inner.submit(router.to_string(), RouterJob::Reconcile)
    }

    /// Reconciles every router that is hosted somewhere.
    pub fn reconcile_all(&self) -> Vec<Ticket> {
        self.inner
            .topology
            .routers()
            .into_iter()
            .filter(|r| !self.inner.topology.nodes_hosting(&r.name).is_empty())
            .map(|r| self.reconcile(&r.name))
            .collect()
    }

    /// Nodes currently programmed for `router`, with their role.
    pub fn roles(&self, router: &str) -> BTreeMap<NodeId, Role> {
        self.inner.roles(router)
    }

    pub fn route_ledger(&self) -> &RouteLedger {
        &self.inner.routes
    }

    /// The per-router queue; other multi-step router work joins it.
    pub fn router_queue(&self) -> KeyedWorkQueue<String> {
        self.inner.routers.clone()
    }

    /// Resolves once both queues have drained.
    pub async fn wait_idle(&self) {
        self.nodes.wait_idle().await;
        self.inner.routers.wait_idle().await;
    }
}

impl Coordinator {
    fn submit(self: &Arc<Self>, router: String, job: RouterJob) -> Ticket {
        let inner = Arc::clone(self);
        let label = format!("{job} ({router})");
        self.routers.submit(router.clone(), label, move || {
            let inner = Arc::clone(&inner);
            let router = router.clone();
            let job = job.clone();
            async move { inner.run(&router, &job).await }
        })
    }

    async fn run(&self, router: &str, job: &RouterJob) -> TaskResult<()> {
        debug!(%router, %job, "reconverging");
        match job {
            RouterJob::Hosted { node, added: true } => self.hosted(router, *node).await,
            RouterJob::Hosted { node, added: false } => self.unhosted(router, *node).await,
            RouterJob::TunnelEndpoint { node, added: true } => self.tep_up(router, *node).await,
            RouterJob::TunnelEndpoint { node, added: false } => self.tep_down(router, *node).await,
            RouterJob::Removed(r) => self.removed(r).await,
            RouterJob::Reconcile => self.reconcile(router).await,
        }
    }

    fn router(&self, name: &str) -> TaskResult<Router> {
        self.topology
            .router(name)
            .ok_or_else(|| TaskError::not_found(format!("router {name}")))
    }

    fn roles(&self, router: &str) -> BTreeMap<NodeId, Role> {
        self.roles
            .get(router)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn set_role(&self, router: &str, node: NodeId, role: Option<Role>) {
        match role {
            Some(role) => {
                self.roles
                    .entry(router.to_string())
                    .or_default()
                    .insert(node, role);
            }
            None => {
                if let Some(mut roles) = self.roles.get_mut(router) {
                    roles.remove(&node);
                }
                self.roles.remove_if(router, |_, roles| roles.is_empty());
            }
        }
    }

    fn programmed(&self, router: &str) -> Option<NodeId> {
        self.programmed.get(router).map(|node| *node)
    }

    async fn make_primary(&self, node: NodeId, router: &Router) -> TaskResult<()> {
        self.flows.add_primary(node, router).await?;
        self.set_role(&router.name, node, Some(Role::Primary));
        Ok(())
    }

    async fn make_secondary(&self, node: NodeId, router: &Router, primary: NodeId) -> TaskResult<()> {
        self.flows.add_secondary(node, router, primary).await?;
        self.set_role(&router.name, node, Some(Role::Secondary));
        Ok(())
    }

    /// Removes whatever `node` holds for `router`, including the session
    /// rules a primary carries.
    async fn clear_node(&self, node: NodeId, router: &Router) -> TaskResult<()> {
        let primary = match self.roles(&router.name).get(&node) {
            Some(role) => *role == Role::Primary,
            // Not tracked, e.g. after a restart: fall back to the stored primary.
            None => self.topology.primary(&router.name).map(|a| a.node) == Some(node),
        };
        if primary {
            for (internal, protocol) in self.pools.port_mappings(router.id) {
                self.flows
                    .remove_session(node, router.id, internal, protocol)
                    .await?;
            }
            self.flows.remove_primary(node, router).await?;
        } else {
            self.flows.remove_secondary(node, router).await?;
        }
        self.set_role(&router.name, node, None);
        Ok(())
    }

    /// Programs every node for `primary`: primary rules and routes (when
    /// SNAT is enabled) and secondary rules on every other reachable host.
    async fn apply_roles(&self, router: &Router, primary: NodeId) -> TaskResult<()> {
        for (node, role) in self.roles(&router.name) {
            if role == Role::Primary && node != primary {
                self.clear_node(node, router).await?;
            }
        }

        if router.enable_snat {
            self.make_primary(primary, router).await?;
            self.routes.advertise_via(router, primary).await?;
        }

        for node in self.topology.nodes_hosting(&router.name) {
            if node == primary {
                continue;
            }
            if self.topology.tunnel_endpoint(node).is_none() {
                debug!(router = %router.name, %node, "no tunnel endpoint, skipping secondary");
                continue;
            }
            self.make_secondary(node, router, primary).await?;
        }
        self.programmed.insert(router.name.clone(), primary);
        Ok(())
    }

    /// Programs the live persisted primary if an earlier attempt stored it
    /// without finishing.
    async fn settle(&self, router: &Router) -> TaskResult<()> {
        match self.elector.live_primary(&router.name) {
            Some(primary) if self.programmed(&router.name) != Some(primary) => {
                info!(router = %router.name, %primary, "programming persisted primary");
                self.apply_roles(router, primary).await
            }
            _ => Ok(()),
        }
    }

    async fn hosted(&self, name: &str, node: NodeId) -> TaskResult<()> {
        let router = self.router(name)?;
        let Some(primary) = self.elector.primary_or_elect(name).await? else {
            info!(router = %name, %node, "no primary candidate yet");
            return Ok(());
        };

        if self.programmed(name) != Some(primary) {
            return self.apply_roles(&router, primary).await;
        }
        if node != primary && self.topology.tunnel_endpoint(node).is_some() {
            self.make_secondary(node, &router, primary).await?;
        }
        if router.enable_snat {
            self.make_primary(primary, &router).await?;
            self.routes.advertise_via(&router, primary).await?;
        }
        Ok(())
    }

    async fn unhosted(&self, name: &str, node: NodeId) -> TaskResult<()> {
        let Some(router) = self.topology.router(name) else {
            debug!(router = %name, %node, "router already gone");
            return Ok(());
        };
        let was_primary = self.was_primary(name, node);

        self.clear_node(node, &router).await?;
        if !was_primary {
            return self.settle(&router).await;
        }

        self.routes.withdraw_via(name, node).await?;
        if self.topology.nodes_hosting(name).is_empty() {
            info!(router = %name, "no hosts left, clearing primary");
            self.routes.withdraw_all(&router).await?;
            self.elector.clear_primary(name).await?;
            self.programmed.remove(name);
            return Ok(());
        }
        self.reelect(&router, node).await
    }

    /// Whether `node` is the stored primary, or still the programmed one
    /// after an interrupted move.
    fn was_primary(&self, name: &str, node: NodeId) -> bool {
        self.topology.primary(name).map(|a| a.node) == Some(node)
            || self.programmed(name) == Some(node)
    }

    async fn tep_up(&self, name: &str, node: NodeId) -> TaskResult<()> {
        let router = self.router(name)?;
        match self.elector.live_primary(name) {
            // Back on the primary: its routes may carry an old next hop and
            // secondaries may point at an old address.
            Some(primary) if primary == node || self.programmed(name) != Some(primary) => {
                self.apply_roles(&router, primary).await
            }
            Some(primary) => {
                if self.topology.nodes_hosting(name).contains(&node) {
                    self.make_secondary(node, &router, primary).await?;
                }
                Ok(())
            }
            None => match self.elector.primary_or_elect(name).await? {
                Some(primary) => self.apply_roles(&router, primary).await,
                None => Ok(()),
            },
        }
    }

    async fn tep_down(&self, name: &str, node: NodeId) -> TaskResult<()> {
        let router = self.router(name)?;
        if !self.was_primary(name, node) {
            // A secondary only loses its redirection; nothing is re-elected.
            self.clear_node(node, &router).await?;
            return self.settle(&router).await;
        }

        warn!(router = %name, %node, "primary lost its tunnel endpoint");
        self.routes.withdraw_via(name, node).await?;
        self.clear_node(node, &router).await?;
        self.reelect(&router, node).await
    }

    /// Elects a replacement for `lost` and reprograms every node for it.
    ///
    /// A replacement stored by an earlier attempt is kept.
    async fn reelect(&self, router: &Router, lost: NodeId) -> TaskResult<()> {
        let replacement = match self.elector.live_primary(&router.name).filter(|p| *p != lost) {
            Some(stored) => Some(stored),
            None => {
                let exclude = BTreeSet::from([lost]);
                self.elector.select_primary(&router.name, &exclude).await?
            }
        };
        match replacement {
            Some(primary) => {
                info!(router = %router.name, from = %lost, to = %primary, "primary moved");
                self.apply_roles(router, primary).await
            }
            None => {
                warn!(router = %router.name, %lost, "no replacement primary available");
                self.programmed.remove(&router.name);
                Ok(())
            }
        }
    }

    async fn removed(&self, router: &Router) -> TaskResult<()> {
        for node in self.roles(&router.name).into_keys() {
            self.clear_node(node, router).await?;
        }
        self.routes.withdraw_all(router).await?;
        let released = self.pools.remove_mapping(router.id).await?;
        self.flows.release_router(router).await?;
        self.elector.clear_primary(&router.name).await?;
        self.programmed.remove(&router.name);
        info!(router = %router.name, mappings = released, "router state released");
        Ok(())
    }

    async fn reconcile(&self, name: &str) -> TaskResult<()> {
        let router = self.router(name)?;
        if self.topology.nodes_hosting(name).is_empty() {
            return Ok(());
        }
        match self.elector.primary_or_elect(name).await? {
            Some(primary) => self.apply_roles(&router, primary).await,
            None => Ok(()),
        }
    }

    /// Runs the endpoint change for every affected router and waits for
    /// all of them.
    async fn fan_out_tunnel_endpoint(self: &Arc<Self>, node: NodeId, added: bool) -> TaskResult<()> {
        let mut affected: BTreeSet<String> = self.topology.routers_on_node(node).into_iter().collect();
        affected.extend(
            self.topology
                .primaries()
                .into_iter()
                .filter(|a| a.node == node)
                .map(|a| a.router),
        );
        for entry in self.roles.iter() {
            if entry.value().contains_key(&node) {
                affected.insert(entry.key().clone());
            }
        }

        info!(%node, added, routers = affected.len(), "tunnel endpoint changed");
        let tickets: Vec<Ticket> = affected
            .into_iter()
            .map(|router| self.submit(router, RouterJob::TunnelEndpoint { node, added }))
            .collect();

        let mut failed = 0;
        for ticket in tickets {
            if ticket.wait().await.is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(%node, failed, "some routers did not reconverge");
        }
        debug!(stats = ?self.stats.snapshot(), "after tunnel endpoint change");
        Ok(())
    }
}

#[async_trait]
impl Orch for ReconvergenceCoordinator {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn on_timer(&self) {
        let Some(interval) = self.reconcile_interval else {
            return;
        };
        {
            let mut last = self.last_reconcile.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < interval {
                return;
            }
            *last = Instant::now();
        }
        let tickets = self.reconcile_all();
        debug!(routers = tickets.len(), "periodic reconcile queued");
    }

    fn has_pending_tasks(&self) -> bool {
        self.nodes.pending() + self.inner.routers.pending() > 0
    }

    fn dump_pending_tasks(&self) -> Vec<String> {
        self.nodes
            .active_keys()
            .into_iter()
            .map(|n| format!("node {n}"))
            .chain(
                self.inner
                    .routers
                    .active_keys()
                    .into_iter()
                    .map(|r| format!("router {r}")),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExternalNetwork, ProviderType};
    use crate::services::{
        Journal, JournalEntry, MemoryIdAllocator, MemoryRouteAdvertiser, MemoryRuleInstaller,
        MemoryTopology, RuleInstaller,
    };
    use crate::flows::Session;
    use napt_types::{Protocol, RouterId};
    use std::net::SocketAddrV4;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    struct Fixture {
        topo: Arc<MemoryTopology>,
        installer: Arc<MemoryRuleInstaller>,
        advertiser: Arc<MemoryRouteAdvertiser>,
        journal: Journal,
        flows: Arc<TranslationFlowProgrammer>,
        pools: Arc<AddressPoolManager>,
        coordinator: ReconvergenceCoordinator,
        router: Router,
    }

    fn tep(n: u64) -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, n as u8)
    }

    fn fixture() -> Fixture {
        let journal = Journal::new();
        let topo = Arc::new(MemoryTopology::new());
        let alloc = Arc::new(MemoryIdAllocator::new());
        let installer = Arc::new(MemoryRuleInstaller::with_journal(journal.clone()));
        let advertiser = Arc::new(MemoryRouteAdvertiser::with_journal(journal.clone()));
        let stats = Arc::new(NaptStats::new());
        let config = NaptConfig::default();

        let net = ExternalNetwork {
            id: Uuid::new_v4(),
            name: "ext".into(),
            provider: ProviderType::Gre,
            vpn: "ext-vpn".into(),
        };
        let router = Router::new(RouterId::new(1), "r1", net.id)
            .with_external_ip("203.0.113.5/32".parse().unwrap(), Uuid::new_v4());
        topo.add_network(net);
        topo.add_router(router.clone());
        for n in 1..=3 {
            topo.set_tunnel_endpoint(NodeId::new(n), tep(n));
        }

        let flows = Arc::new(TranslationFlowProgrammer::from_config(
            topo.clone(),
            alloc.clone(),
            installer.clone(),
            stats.clone(),
            &config,
        ));
        let (low, high) = (config.pools.port_range.low as u16, config.pools.port_range.high as u16);
        let pools = Arc::new(AddressPoolManager::new(alloc.clone(), stats.clone(), low, high));
        let elector = Arc::new(PrimarySwitchElector::new(topo.clone(), stats.clone()));
        let routes = RouteLedger::new(
            topo.clone(),
            advertiser.clone(),
            alloc.clone(),
            flows.clone(),
            stats.clone(),
            (config.pools.label_range.low, config.pools.label_range.high),
        );
        let coordinator = ReconvergenceCoordinator::new(
            topo.clone(),
            elector,
            flows.clone(),
            pools.clone(),
            routes,
            stats,
            &config,
        );
        Fixture {
            topo,
            installer,
            advertiser,
            journal,
            flows,
            pools,
            coordinator,
            router,
        }
    }

    async fn host(f: &Fixture, node: u64) {
        f.topo.host_router("r1", NodeId::new(node));
        f.coordinator
            .on_router_hosted_on_node("r1", NodeId::new(node), true)
            .wait()
            .await
            .unwrap();
    }

    fn group_id(f: &Fixture) -> u32 {
        f.flows.existing_plan(&f.router).group_id.unwrap()
    }

    #[tokio::test]
    async fn test_first_host_becomes_primary() {
        let f = fixture();
        host(&f, 1).await;

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(1));
        assert_eq!(f.coordinator.roles("r1"), BTreeMap::from([(NodeId::new(1), Role::Primary)]));
        let routes = f.advertiser.all_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, tep(1));
    }

    #[tokio::test]
    async fn test_second_host_becomes_secondary() {
        let f = fixture();
        host(&f, 1).await;
        host(&f, 2).await;

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(1));
        assert_eq!(
            f.coordinator.roles("r1"),
            BTreeMap::from([(NodeId::new(1), Role::Primary), (NodeId::new(2), Role::Secondary)])
        );
        assert!(f.installer.group(NodeId::new(2), group_id(&f)).is_some());
    }

    #[tokio::test]
    async fn test_snat_disabled_skips_primary_rules() {
        let f = fixture();
        f.topo.add_router(f.router.clone().with_snat(false));
        host(&f, 1).await;

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(1));
        assert!(f.installer.rules_on(NodeId::new(1)).is_empty());
        assert!(f.advertiser.all_routes().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_tep_loss_keeps_primary() {
        let f = fixture();
        host(&f, 1).await;
        host(&f, 2).await;

        f.topo.remove_tunnel_endpoint(NodeId::new(2));
        f.coordinator
            .on_tunnel_endpoint(NodeId::new(2), false)
            .wait()
            .await
            .unwrap();

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(1));
        assert!(f.installer.rules_on(NodeId::new(2)).is_empty());
        assert!(f.installer.groups_on(NodeId::new(2)).is_empty());
        assert!(!f.installer.rules_on(NodeId::new(1)).is_empty());
    }

    #[tokio::test]
    async fn test_primary_tep_loss_moves_primary() {
        let f = fixture();
        for n in 1..=3 {
            host(&f, n).await;
        }
        f.journal.clear();

        f.topo.remove_tunnel_endpoint(NodeId::new(1));
        f.coordinator
            .on_tunnel_endpoint(NodeId::new(1), false)
            .wait()
            .await
            .unwrap();

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(2));
        let withdraw = f
            .journal
            .position(|e| matches!(e, JournalEntry::Withdraw { next_hop, .. } if *next_hop == tep(1)))
            .unwrap();
        let advertise = f
            .journal
            .position(|e| matches!(e, JournalEntry::Advertise { next_hop, .. } if *next_hop == tep(2)))
            .unwrap();
        assert!(withdraw < advertise);
        assert_eq!(f.advertiser.all_routes().len(), 1);

        let group = f.installer.group(NodeId::new(3), group_id(&f)).unwrap();
        assert!(format!("{group:?}").contains("192.0.2.2"));
        assert!(f.installer.rules_on(NodeId::new(1)).is_empty());
    }

    #[tokio::test]
    async fn test_primary_tep_restored_readvertises() {
        let f = fixture();
        host(&f, 1).await;
        f.topo.remove_tunnel_endpoint(NodeId::new(1));
        f.coordinator
            .on_tunnel_endpoint(NodeId::new(1), false)
            .wait()
            .await
            .unwrap();
        assert!(f.advertiser.all_routes().is_empty());

        f.topo.set_tunnel_endpoint(NodeId::new(1), Ipv4Addr::new(192, 0, 2, 101));
        f.coordinator
            .on_tunnel_endpoint(NodeId::new(1), true)
            .wait()
            .await
            .unwrap();

        let routes = f.advertiser.all_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, Ipv4Addr::new(192, 0, 2, 101));
        assert_eq!(f.coordinator.roles("r1").get(&NodeId::new(1)), Some(&Role::Primary));
    }

    #[tokio::test]
    async fn test_failed_primary_move_is_finished_on_retry() {
        let f = fixture();
        for n in 1..=3 {
            host(&f, n).await;
        }

        f.topo.remove_tunnel_endpoint(NodeId::new(1));
        f.installer.fail_next_installs(1);
        f.coordinator
            .on_tunnel_endpoint(NodeId::new(1), false)
            .wait()
            .await
            .unwrap();

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(2));
        assert_eq!(
            f.coordinator.roles("r1"),
            BTreeMap::from([(NodeId::new(2), Role::Primary), (NodeId::new(3), Role::Secondary)])
        );
        assert!(!f.installer.rules_on(NodeId::new(2)).is_empty());
        assert!(f.installer.rules_on(NodeId::new(1)).is_empty());
        let routes = f.advertiser.all_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, tep(2));
    }

    #[tokio::test]
    async fn test_election_on_host_clears_old_primary_sessions() {
        let f = fixture();
        host(&f, 1).await;
        host(&f, 2).await;

        let internal = "10.0.0.0/24".parse().unwrap();
        let external = "203.0.113.5/32".parse().unwrap();
        f.pools.register_mapping(RouterId::new(1), internal, external).await.unwrap();
        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 40_000);
        let mapped = f
            .pools
            .get_external_address_mapping(RouterId::new(1), source, Protocol::Tcp)
            .await
            .unwrap()
            .unwrap();
        let session = Session {
            router: RouterId::new(1),
            internal: source,
            external: mapped,
            protocol: Protocol::Tcp,
        };
        f.flows.install_session_inbound(NodeId::new(1), &session).await.unwrap();
        f.flows.install_session_outbound(NodeId::new(1), &session).await.unwrap();

        // The endpoint loss is only noticed by the next hosting change.
        f.topo.remove_tunnel_endpoint(NodeId::new(1));
        host(&f, 3).await;

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(2));
        assert!(f.installer.rules_on(NodeId::new(1)).is_empty());
        assert_eq!(f.coordinator.roles("r1").get(&NodeId::new(1)), None);
    }

    #[tokio::test]
    async fn test_unhost_primary_reelects() {
        let f = fixture();
        host(&f, 1).await;
        host(&f, 2).await;

        f.topo.unhost_router("r1", NodeId::new(1));
        f.coordinator
            .on_router_hosted_on_node("r1", NodeId::new(1), false)
            .wait()
            .await
            .unwrap();

        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(2));
        assert_eq!(f.coordinator.roles("r1"), BTreeMap::from([(NodeId::new(2), Role::Primary)]));
        assert_eq!(f.advertiser.all_routes()[0].next_hop, tep(2));
    }

    #[tokio::test]
    async fn test_unhost_last_clears_primary() {
        let f = fixture();
        host(&f, 1).await;

        f.topo.unhost_router("r1", NodeId::new(1));
        f.coordinator
            .on_router_hosted_on_node("r1", NodeId::new(1), false)
            .wait()
            .await
            .unwrap();

        assert!(f.topo.primary("r1").is_none());
        assert!(f.advertiser.all_routes().is_empty());
        assert_eq!(f.installer.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_router_removed_releases_everything() {
        let f = fixture();
        host(&f, 1).await;
        host(&f, 2).await;

        let router = f.topo.remove_router("r1").unwrap();
        f.coordinator.on_router_removed(router).wait().await.unwrap();

        assert!(f.topo.primary("r1").is_none());
        assert_eq!(f.installer.rule_count(), 0);
        assert!(f.installer.groups_on(NodeId::new(2)).is_empty());
        assert!(f.advertiser.all_routes().is_empty());
        assert!(f.coordinator.roles("r1").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_restores_missing_rules() {
        let f = fixture();
        host(&f, 1).await;
        let before = f.installer.rule_count();
        for rule in f.installer.rules_on(NodeId::new(1)) {
            f.installer.remove_rule(NodeId::new(1), &rule.rule_ref).await.unwrap();
        }

        for ticket in f.coordinator.reconcile_all() {
            ticket.wait().await.unwrap();
        }
        assert_eq!(f.installer.rule_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_reconciles_after_interval() {
        let mut f = fixture();
        let mut config = NaptConfig::default();
        config.daemon.reconcile_interval_ms = Some(1_000);
        f.coordinator.reconcile_interval = config.reconcile_interval();
        host(&f, 1).await;

        f.coordinator.on_timer().await;
        assert!(!f.coordinator.has_pending_tasks());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        f.coordinator.on_timer().await;
        f.coordinator.wait_idle().await;
        assert_eq!(f.coordinator.roles("r1").len(), 1);
    }
}
