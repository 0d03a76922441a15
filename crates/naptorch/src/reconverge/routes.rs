//! Ledger of external routes advertised per router.
//!
//! The ledger remembers which node each route was advertised through, so a
//! route via a node that has since lost its tunnel endpoint can still be
//! withdrawn with the next hop it was advertised with.

use crate::audit::{AuditCategory, AuditRecord};
use crate::audit_log;
use crate::flows::{ModeKind, TranslationFlowProgrammer};
use crate::model::{ExternalNetwork, Router};
use crate::services::{ExternalRoute, IdAllocator, RouteAdvertiser, RouteOrigin, TopologyStore};
use crate::stats::NaptStats;
use dashmap::DashMap;
use napt_orch_common::{TaskError, TaskResult};
use napt_types::{Ipv4Prefix, NodeId};
use std::sync::Arc;
use tracing::{debug, info};

/// Label pool for advertisements outside the cross-domain mode, keyed by
/// `vpn/prefix`.
pub const LABEL_POOL: &str = "napt.label";

const SOURCE: &str = "ReconvergenceCoordinator";

fn label_key(vpn: &str, prefix: &Ipv4Prefix) -> String {
    format!("{vpn}/{prefix}")
}

pub struct RouteLedger {
    topology: Arc<dyn TopologyStore>,
    advertiser: Arc<dyn RouteAdvertiser>,
    allocator: Arc<dyn IdAllocator>,
    flows: Arc<TranslationFlowProgrammer>,
    stats: Arc<NaptStats>,
    label_range: (u32, u32),
    advertised: DashMap<String, Vec<(ExternalRoute, NodeId)>>,
}

impl RouteLedger {
    pub fn new(
        topology: Arc<dyn TopologyStore>,
        advertiser: Arc<dyn RouteAdvertiser>,
        allocator: Arc<dyn IdAllocator>,
        flows: Arc<TranslationFlowProgrammer>,
        stats: Arc<NaptStats>,
        label_range: (u32, u32),
    ) -> Self {
        Self {
            topology,
            advertiser,
            allocator,
            flows,
            stats,
            label_range,
            advertised: DashMap::new(),
        }
    }

    /// Routes currently advertised for `router` and the node each goes via.
    pub fn advertised(&self, router: &str) -> Vec<(ExternalRoute, NodeId)> {
        self.advertised
            .get(router)
            .map(|routes| routes.clone())
            .unwrap_or_default()
    }

    fn network(&self, router: &Router) -> TaskResult<ExternalNetwork> {
        self.topology
            .external_network(&router.external_network_id)
            .ok_or_else(|| {
                TaskError::not_found(format!(
                    "external network {} of router {}",
                    router.external_network_id, router.name
                ))
            })
    }

    /// Encapsulation service id: the router VNI across domains, a label
    /// per prefix otherwise.
    async fn service_id(
        &self,
        router: &Router,
        network: &ExternalNetwork,
        prefix: &Ipv4Prefix,
    ) -> TaskResult<u32> {
        if self.flows.mode_kind(Some(network)) == ModeKind::CrossDomain {
            return Ok(self.flows.tunnel_key(router));
        }
        self.flows
            .context()
            .allocate_id(LABEL_POOL, self.label_range, &label_key(&network.vpn, prefix))
            .await
    }

    /// Advertises every external address of `router` with `node`'s tunnel
    /// endpoint as next hop.
    ///
    /// Local entries for the same prefixes with any other next hop are
    /// withdrawn first, so upstream never sees two paths at once.
    pub async fn advertise_via(&self, router: &Router, node: NodeId) -> TaskResult<()> {
        let network = self.network(router)?;
        let tep = self
            .topology
            .tunnel_endpoint(node)
            .ok_or_else(|| TaskError::not_found(format!("tunnel endpoint of {node}")))?;

        let mut routes = Vec::with_capacity(router.external_ips.len());
        for ip in &router.external_ips {
            routes.push(ExternalRoute {
                vpn: network.vpn.clone(),
                prefix: ip.prefix,
                next_hop: tep.ip,
                service_id: self.service_id(router, &network, &ip.prefix).await?,
                origin: RouteOrigin::Local,
            });
        }

        // Stale entries: whatever the ledger holds via another node, plus
        // local entries in the table with a different next hop.
        for (route, via) in self.advertised(&router.name) {
            if route.next_hop != tep.ip || via != node {
                self.withdraw_one(&router.name, &route, via).await?;
            }
        }
        for route in &routes {
            let stale: Vec<ExternalRoute> = self
                .advertiser
                .routes(&route.vpn, &route.prefix)
                .into_iter()
                .filter(|r| r.origin == RouteOrigin::Local && r.next_hop != tep.ip)
                .collect();
            for old in stale {
                debug!(router = %router.name, prefix = %old.prefix, next_hop = %old.next_hop, "withdrawing stale local route");
                self.advertiser.withdraw(&old).await?;
                NaptStats::incr(&self.stats.routes_withdrawn);
            }
        }

        for route in routes {
            let result = self.advertiser.advertise(&route).await.map_err(TaskError::from);
            audit_log!(
                AuditRecord::new(AuditCategory::RouteAdvertisement, SOURCE, "advertise")
                    .with_result(&result)
                    .with_object_id(route.prefix.to_string())
                    .with_object_type("external_route")
                    .with_details(serde_json::json!({
                        "router": router.name,
                        "vpn": route.vpn,
                        "next_hop": route.next_hop.to_string(),
                        "via": node.to_string(),
                        "service_id": route.service_id,
                    }))
            );
            result?;
            NaptStats::incr(&self.stats.routes_advertised);

            let mut entry = self.advertised.entry(router.name.clone()).or_default();
            entry.retain(|(r, _)| r.prefix != route.prefix);
            entry.push((route, node));
        }
        info!(router = %router.name, via = %node, next_hop = %tep.ip, "external routes advertised");
        Ok(())
    }

    async fn withdraw_one(&self, router: &str, route: &ExternalRoute, via: NodeId) -> TaskResult<()> {
        let result = self.advertiser.withdraw(route).await.map_err(TaskError::from);
        audit_log!(
            AuditRecord::new(AuditCategory::RouteAdvertisement, SOURCE, "withdraw")
                .with_result(&result)
                .with_object_id(route.prefix.to_string())
                .with_object_type("external_route")
                .with_details(serde_json::json!({
                    "router": router,
                    "vpn": route.vpn,
                    "next_hop": route.next_hop.to_string(),
                    "via": via.to_string(),
                }))
        );
        result?;
        NaptStats::incr(&self.stats.routes_withdrawn);

        if let Some(mut entry) = self.advertised.get_mut(router) {
            entry.retain(|(r, n)| !(r == route && *n == via));
        }
        self.advertised.remove_if(router, |_, routes| routes.is_empty());
        Ok(())
    }

    /// Withdraws the routes advertised via `node`. Returns how many there
    /// were.
    pub async fn withdraw_via(&self, router: &str, node: NodeId) -> TaskResult<usize> {
        let routes: Vec<ExternalRoute> = self
            .advertised(router)
            .into_iter()
            .filter(|(_, via)| *via == node)
            .map(|(route, _)| route)
            .collect();
        for route in &routes {
            self.withdraw_one(router, route, node).await?;
        }
        if !routes.is_empty() {
            info!(%router, via = %node, count = routes.len(), "external routes withdrawn");
        }
        Ok(routes.len())
    }

    /// Withdraws everything advertised for `router` and returns its labels.
    pub async fn withdraw_all(&self, router: &Router) -> TaskResult<()> {
        for (route, via) in self.advertised(&router.name) {
            self.withdraw_one(&router.name, &route, via).await?;
        }
        if let Ok(network) = self.network(router) {
            if self.flows.mode_kind(Some(&network)) != ModeKind::CrossDomain {
                for ip in &router.external_ips {
                    self.allocator
                        .release(LABEL_POOL, &label_key(&network.vpn, &ip.prefix))
                        .await?;
                }
            }
        }
        Ok(())
    }
}
