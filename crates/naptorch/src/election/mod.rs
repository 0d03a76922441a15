//! PrimarySwitchElector - chooses the node that owns a router's NAT state.
//!
//! Candidates are the nodes hosting the router minus excluded nodes and
//! nodes without a tunnel endpoint. A candidate's weight is the number of
//! routers it is already the persisted primary for, recomputed from the full
//! assignment set on every call. The lightest candidate wins; equal weights
//! go to the lowest node id.

use crate::audit::{AuditCategory, AuditRecord};
use crate::audit_log;
use crate::model::PrimaryAssignment;
use crate::services::TopologyStore;
use crate::stats::NaptStats;
use napt_orch_common::{TaskError, TaskResult};
use napt_types::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SOURCE: &str = "PrimarySwitchElector";

pub struct PrimarySwitchElector {
    topology: Arc<dyn TopologyStore>,
    stats: Arc<NaptStats>,
}

impl PrimarySwitchElector {
    pub fn new(topology: Arc<dyn TopologyStore>, stats: Arc<NaptStats>) -> Self {
        Self { topology, stats }
    }

    /// Per-node count of persisted primary assignments.
    pub fn weights(&self) -> BTreeMap<NodeId, usize> {
        let mut weights = BTreeMap::new();
        for assignment in self.topology.primaries() {
            *weights.entry(assignment.node).or_insert(0) += 1;
        }
        weights
    }

    /// Hosting nodes eligible to become primary.
    pub fn candidates(&self, router: &str, exclude: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        self.topology
            .nodes_hosting(router)
            .into_iter()
            .filter(|node| !exclude.contains(node))
            .filter(|node| self.topology.tunnel_endpoint(*node).is_some())
            .collect()
    }

    /// Elects and persists a primary for `router`.
    ///
    /// Returns `Ok(None)` without writing anything when no candidate is left;
    /// callers retry once topology provides one.
    pub async fn select_primary(
        &self,
        router: &str,
        exclude: &BTreeSet<NodeId>,
    ) -> TaskResult<Option<NodeId>> {
        let candidates = self.candidates(router, exclude);
        if candidates.is_empty() {
            NaptStats::incr(&self.stats.elections_without_candidate);
            warn!(%router, excluded = ?exclude, "no candidate node for primary election");
            return Ok(None);
        }

        let weights = self.weights();
        // BTreeSet iterates in node order, so min_by_key keeps the lowest
        // node among equal weights.
        let Some(chosen) = candidates
            .iter()
            .copied()
            .min_by_key(|node| weights.get(node).copied().unwrap_or(0))
        else {
            return Ok(None);
        };

        let previous = self.topology.primary(router).map(|a| a.node);
        let result = self
            .topology
            .put_primary(PrimaryAssignment::new(router, chosen))
            .await
            .map_err(TaskError::from);

        audit_log!(AuditRecord::new(AuditCategory::Election, SOURCE, "select_primary")
            .with_result(&result)
            .with_object_id(router)
            .with_object_type("router")
            .with_details(serde_json::json!({
                "primary": chosen.to_string(),
                "previous": previous.map(|n| n.to_string()),
                "candidates": candidates.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
                "weight": weights.get(&chosen).copied().unwrap_or(0),
            })));
        result?;

        NaptStats::incr(&self.stats.elections);
        info!(%router, primary = %chosen, ?previous, "primary elected");
        Ok(Some(chosen))
    }

    /// Returns the persisted primary if it still hosts the router and is
    /// healthy, otherwise elects one.
    pub async fn primary_or_elect(&self, router: &str) -> TaskResult<Option<NodeId>> {
        if let Some(node) = self.live_primary(router) {
            return Ok(Some(node));
        }
        let stale = self.topology.primary(router).map(|a| a.node);
        debug!(%router, ?stale, "no live primary, electing");
        let exclude = stale.into_iter().collect();
        self.select_primary(router, &exclude).await
    }

    /// The persisted primary, if it still hosts the router with a tunnel
    /// endpoint up.
    pub fn live_primary(&self, router: &str) -> Option<NodeId> {
        let node = self.topology.primary(router)?.node;
        let hosts = self.topology.nodes_hosting(router).contains(&node);
        let healthy = self.topology.tunnel_endpoint(node).is_some();
        (hosts && healthy).then_some(node)
    }

    /// Deletes the router's assignment.
    pub async fn clear_primary(&self, router: &str) -> TaskResult<()> {
        let previous = self.topology.primary(router);
        if previous.is_none() {
            return Ok(());
        }
        let result = self.topology.delete_primary(router).await.map_err(TaskError::from);
        audit_log!(AuditRecord::new(AuditCategory::Election, SOURCE, "clear_primary")
            .with_result(&result)
            .with_object_id(router)
            .with_object_type("router"));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Router;
    use crate::services::MemoryTopology;
    use napt_types::RouterId;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    fn setup(nodes: &[u64]) -> (Arc<MemoryTopology>, PrimarySwitchElector) {
        let topo = Arc::new(MemoryTopology::new());
        for n in nodes {
            topo.set_tunnel_endpoint(NodeId::new(*n), Ipv4Addr::new(192, 0, 2, *n as u8));
        }
        let elector = PrimarySwitchElector::new(topo.clone(), Arc::new(NaptStats::new()));
        (topo, elector)
    }

    fn host(topo: &MemoryTopology, router: &str, id: u32, nodes: &[u64]) {
        topo.add_router(Router::new(RouterId::new(id), router, Uuid::new_v4()));
        for n in nodes {
            topo.host_router(router, NodeId::new(*n));
        }
    }

    #[tokio::test]
    async fn test_elects_least_loaded() {
        let (topo, elector) = setup(&[1, 2, 3]);
        topo.set_primary("busy-a", NodeId::new(1));
        topo.set_primary("busy-b", NodeId::new(1));
        topo.set_primary("busy-c", NodeId::new(2));
        host(&topo, "r1", 1, &[1, 2, 3]);

        let chosen = elector.select_primary("r1", &BTreeSet::new()).await.unwrap();
        assert_eq!(chosen, Some(NodeId::new(3)));
        assert_eq!(topo.primary("r1").unwrap().node, NodeId::new(3));
    }

    #[tokio::test]
    async fn test_tie_breaks_to_lowest_node() {
        let (topo, elector) = setup(&[4, 2, 9]);
        host(&topo, "r1", 1, &[9, 4, 2]);

        let chosen = elector.select_primary("r1", &BTreeSet::new()).await.unwrap();
        assert_eq!(chosen, Some(NodeId::new(2)));
    }

    #[tokio::test]
    async fn test_excluded_and_unhealthy_skipped() {
        let (topo, elector) = setup(&[1, 2]);
        // dpn-3 hosts the router but has no tunnel endpoint
        host(&topo, "r1", 1, &[1, 2, 3]);

        let exclude = BTreeSet::from([NodeId::new(1)]);
        assert_eq!(
            elector.candidates("r1", &exclude),
            BTreeSet::from([NodeId::new(2)])
        );
        assert_eq!(
            elector.select_primary("r1", &exclude).await.unwrap(),
            Some(NodeId::new(2))
        );
    }

    #[tokio::test]
    async fn test_no_candidate_writes_nothing() {
        let (topo, elector) = setup(&[1]);
        host(&topo, "r1", 1, &[1]);
        topo.set_primary("r1", NodeId::new(1));

        let exclude = BTreeSet::from([NodeId::new(1)]);
        assert_eq!(elector.select_primary("r1", &exclude).await.unwrap(), None);
        // Old assignment untouched
        assert_eq!(topo.primary("r1").unwrap().node, NodeId::new(1));
    }

    #[tokio::test]
    async fn test_persist_failure_is_retryable() {
        let (topo, elector) = setup(&[1]);
        host(&topo, "r1", 1, &[1]);
        topo.fail_next_writes(1);

        let err = elector
            .select_primary("r1", &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(topo.primary("r1").is_none());
    }

    #[tokio::test]
    async fn test_weights_recomputed_each_call() {
        let (topo, elector) = setup(&[1, 2]);
        host(&topo, "r1", 1, &[1, 2]);
        host(&topo, "r2", 2, &[1, 2]);

        let first = elector.select_primary("r1", &BTreeSet::new()).await.unwrap();
        let second = elector.select_primary("r2", &BTreeSet::new()).await.unwrap();
        assert_eq!(first, Some(NodeId::new(1)));
        assert_eq!(second, Some(NodeId::new(2)));
        assert_eq!(elector.weights().get(&NodeId::new(2)), Some(&1));
    }

    #[tokio::test]
    async fn test_primary_or_elect_keeps_live_primary() {
        let (topo, elector) = setup(&[1, 2]);
        host(&topo, "r1", 1, &[1, 2]);
        topo.set_primary("r1", NodeId::new(2));

        assert_eq!(
            elector.primary_or_elect("r1").await.unwrap(),
            Some(NodeId::new(2))
        );

        topo.remove_tunnel_endpoint(NodeId::new(2));
        assert_eq!(elector.live_primary("r1"), None);
        assert_eq!(
            elector.primary_or_elect("r1").await.unwrap(),
            Some(NodeId::new(1))
        );
    }

    #[tokio::test]
    async fn test_clear_primary() {
        let (topo, elector) = setup(&[1]);
        topo.set_primary("r1", NodeId::new(1));
        elector.clear_primary("r1").await.unwrap();
        assert!(topo.primary("r1").is_none());
        // Clearing again is a no-op
        elector.clear_primary("r1").await.unwrap();
    }
}
