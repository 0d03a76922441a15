//! Translation modes.
//!
//! Every mode shares the same primary/secondary shape; they differ in the
//! rules that carry translated traffic:
//!
//! * [`ControllerRewriteMode`] punts the first packet of each connection and
//!   relies on per-session rewrite rules installed by the packet processor.
//! * [`ConntrackMode`] hands per-connection translation to the dataplane's
//!   connection tracker; no per-session rules exist.
//! * [`CrossDomainMode`] is the controller mode with the outer
//!   encapsulation tagged by a VNI, provisioned or allocated per router.

use super::dependency::await_group;
use super::types::{
    Action, CtNat, ForwardingRule, GroupKind, MatchField, RedirectionGroup, RuleRef, Table,
    PRIORITY_DEFAULT, PRIORITY_MISS, PRIORITY_TRANSLATION,
};
use crate::model::{ExternalIp, Router};
use crate::services::{IdAllocator, RuleInstaller, TopologyStore};
use crate::stats::NaptStats;
use async_trait::async_trait;
use napt_orch_common::{TaskError, TaskResult};
use napt_types::{NodeId, RouterId};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Pool of router VNIs in the cross-domain mode, keyed by router name.
pub const VNI_POOL: &str = "napt.vni";

/// Pool of redirection group ids, keyed by router name or boundary key.
pub const GROUP_POOL: &str = "napt.group";

/// Pool of connection-tracker zones in the conntrack mode, keyed by router
/// name.
pub const ZONE_POOL: &str = "napt.ct_zone";

/// Zones the connection tracker accepts; 0 is its default zone.
pub const ZONE_RANGE: (u32, u32) = (1, 65_535);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    ControllerRewrite,
    Conntrack,
    CrossDomain,
}

impl ModeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ModeKind::ControllerRewrite => "controller-rewrite",
            ModeKind::Conntrack => "conntrack",
            ModeKind::CrossDomain => "cross-domain",
        }
    }

    /// Whether first packets are punted and answered with session rules.
    pub const fn uses_sessions(&self) -> bool {
        !matches!(self, ModeKind::Conntrack)
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators and limits shared by every mode.
pub struct FlowContext {
    pub topology: Arc<dyn TopologyStore>,
    pub allocator: Arc<dyn IdAllocator>,
    pub installer: Arc<dyn RuleInstaller>,
    pub stats: Arc<NaptStats>,
    /// Bound on waiting for a redirection group to appear
    pub group_wait: Duration,
    pub port_range: (u16, u16),
    pub vni_range: (u32, u32),
    pub group_id_range: (u32, u32),
}

impl FlowContext {
    /// Installs `rule`; a rule forwarding to a group is only installed once
    /// that group is visible on the node.
    pub async fn install(&self, rule: &ForwardingRule) -> TaskResult<()> {
        if let Some(group) = rule.group_dependency() {
            await_group(
                self.installer.as_ref(),
                &self.stats,
                rule.node,
                group,
                self.group_wait,
            )
            .await?;
        }
        self.installer.install_rule(rule).await?;
        NaptStats::incr(&self.stats.rules_installed);
        debug!(node = %rule.node, table = %rule.table, rule = %rule.rule_ref, "rule installed");
        Ok(())
    }

    pub async fn remove(&self, node: NodeId, rule_ref: &RuleRef) -> TaskResult<()> {
        self.installer.remove_rule(node, rule_ref).await?;
        NaptStats::incr(&self.stats.rules_removed);
        debug!(%node, rule = %rule_ref, "rule removed");
        Ok(())
    }

    pub async fn install_group(&self, group: &RedirectionGroup) -> TaskResult<()> {
        self.installer.install_group(group).await?;
        NaptStats::incr(&self.stats.groups_installed);
        debug!(node = %group.node, group = group.id, "group installed");
        Ok(())
    }

    pub async fn remove_group(&self, node: NodeId, group_id: u32) -> TaskResult<()> {
        self.installer.remove_group(node, group_id).await?;
        NaptStats::incr(&self.stats.groups_removed);
        debug!(%node, group = group_id, "group removed");
        Ok(())
    }

    /// Allocates (or returns the already held) value for `key` in `pool`.
    pub async fn allocate_id(&self, pool: &str, range: (u32, u32), key: &str) -> TaskResult<u32> {
        self.allocator.create_pool(pool, range.0, range.1).await?;
        self.allocator
            .allocate(pool, key)
            .await?
            .ok_or_else(|| TaskError::exhausted(pool))
    }
}

/// Everything needed to build one router's rules on any node.
#[derive(Debug, Clone)]
pub struct RouterPlan {
    pub router: Router,
    pub mode: ModeKind,
    /// Key carried on tunnels between secondaries and the primary
    pub tunnel_key: u32,
    /// Redirection group steering secondary traffic to the primary
    pub group_id: Option<u32>,
    /// Per-node group forwarding to the external gateway (flat/VLAN only)
    pub boundary_group: Option<u32>,
    /// Connection-tracker zone (conntrack mode only)
    pub ct_zone: Option<u16>,
}

impl RouterPlan {
    pub fn id(&self) -> RouterId {
        self.router.id
    }

    pub fn network_id(&self) -> Uuid {
        self.router.external_network_id
    }

    fn rule(&self, node: NodeId, table: Table, priority: u16) -> ForwardingRule {
        ForwardingRule::new(node, table, RuleRef::new(node, table, self.id()), priority)
            .with_cookie_router(self.id())
    }

    fn qualified_rule(
        &self,
        node: NodeId,
        table: Table,
        priority: u16,
        qualifier: impl fmt::Display,
    ) -> ForwardingRule {
        ForwardingRule::new(
            node,
            table,
            RuleRef::new(node, table, self.id()).with(qualifier),
            priority,
        )
        .with_cookie_router(self.id())
    }
}

/// Role rules for one translation mode.
///
/// Implementors override the rule builders; the provided add/remove methods
/// install in dependency order and remove in the reverse order.
#[async_trait]
pub trait TranslationMode: Send + Sync {
    fn kind(&self) -> ModeKind;

    /// Table outbound traffic enters after the pre-SNAT stage.
    fn translation_stage(&self) -> Table {
        Table::OutboundNapt
    }

    /// Table inbound traffic to an external address is sent to.
    fn inbound_stage(&self) -> Table {
        Table::InboundNapt
    }

    async fn tunnel_key(&self, _ctx: &FlowContext, router: &Router, _vpn: Option<&str>) -> TaskResult<u32> {
        Ok(router.id.value())
    }

    /// Tunnel key already held by the router, without allocating.
    fn existing_tunnel_key(&self, _ctx: &FlowContext, router: &Router, _vpn: Option<&str>) -> Option<u32> {
        Some(router.id.value())
    }

    async fn release_tunnel_key(&self, _ctx: &FlowContext, _router: &Router) -> TaskResult<()> {
        Ok(())
    }

    /// Pre-SNAT rule sending the router's traffic to the translation stage.
    fn default_forward_rule(&self, node: NodeId, plan: &RouterPlan) -> ForwardingRule {
        plan.rule(node, Table::PreSnat, PRIORITY_DEFAULT)
            .matching(MatchField::RouterMetadata(plan.id()))
            .then(Action::GotoTable(self.translation_stage()))
    }

    /// Accepts tunnel traffic from secondaries on the primary.
    fn terminating_rule(&self, node: NodeId, plan: &RouterPlan) -> ForwardingRule {
        plan.rule(node, Table::Terminating, PRIORITY_DEFAULT)
            .matching(MatchField::TunnelKey(plan.tunnel_key))
            .then(Action::SetRouterMetadata(plan.id()))
            .then(Action::GotoTable(self.translation_stage()))
    }

    fn inbound_rule(&self, node: NodeId, plan: &RouterPlan, ip: &ExternalIp) -> ForwardingRule {
        plan.qualified_rule(node, Table::Fib, PRIORITY_TRANSLATION, ip.address())
            .matching(MatchField::DstIp(ip.prefix))
            .then(Action::SetRouterMetadata(plan.id()))
            .then(Action::GotoTable(self.inbound_stage()))
    }

    /// Forwards translated traffic towards the external network.
    fn outbound_rule(&self, node: NodeId, plan: &RouterPlan, ip: &ExternalIp) -> ForwardingRule {
        let rule = plan
            .qualified_rule(node, Table::NaptForward, PRIORITY_TRANSLATION, ip.address())
            .matching(MatchField::RouterMetadata(plan.id()))
            .matching(MatchField::SrcIp(ip.prefix));
        match (plan.boundary_group, plan.router.gateway_mac) {
            (Some(group), _) => rule.then(Action::Group(group)),
            (None, Some(mac)) => rule
                .then(Action::SetDstMac(mac))
                .then(Action::GotoTable(Table::Fib)),
            (None, None) => rule.then(Action::GotoTable(Table::Fib)),
        }
    }

    /// Mode specific rules in the translation stage.
    fn stage_rules(&self, _node: NodeId, _plan: &RouterPlan) -> Vec<ForwardingRule> {
        Vec::new()
    }

    /// What the primary does with traffic no session matches.
    fn primary_miss_rule(&self, node: NodeId, plan: &RouterPlan) -> Option<ForwardingRule> {
        Some(
            plan.qualified_rule(node, self.translation_stage(), PRIORITY_MISS, "miss")
                .matching(MatchField::RouterMetadata(plan.id()))
                .then(Action::PuntToController),
        )
    }

    fn redirection_group(
        &self,
        node: NodeId,
        plan: &RouterPlan,
        group_id: u32,
        primary_tep: Ipv4Addr,
    ) -> RedirectionGroup {
        RedirectionGroup::new(node, group_id, GroupKind::All).with_bucket(
            1,
            vec![
                Action::SetTunnelKey(plan.tunnel_key),
                Action::Tunnel {
                    remote: primary_tep,
                },
            ],
        )
    }

    /// Secondary miss rule sending everything to the redirection group.
    fn secondary_miss_rule(&self, node: NodeId, plan: &RouterPlan, group_id: u32) -> ForwardingRule {
        plan.qualified_rule(node, self.translation_stage(), PRIORITY_MISS, "miss")
            .matching(MatchField::RouterMetadata(plan.id()))
            .then(Action::Group(group_id))
    }

    /// Primary rules in install order.
    fn primary_rules(&self, node: NodeId, plan: &RouterPlan) -> Vec<ForwardingRule> {
        let mut rules = vec![
            self.default_forward_rule(node, plan),
            self.terminating_rule(node, plan),
        ];
        rules.extend(
            plan.router
                .external_ips
                .iter()
                .map(|ip| self.inbound_rule(node, plan, ip)),
        );
        rules.extend(self.stage_rules(node, plan));
        rules.extend(
            plan.router
                .external_ips
                .iter()
                .map(|ip| self.outbound_rule(node, plan, ip)),
        );
        rules.extend(self.primary_miss_rule(node, plan));
        rules
    }

    async fn add_primary_rules(&self, ctx: &FlowContext, node: NodeId, plan: &RouterPlan) -> TaskResult<()> {
        for rule in self.primary_rules(node, plan) {
            ctx.install(&rule).await?;
        }
        Ok(())
    }

    async fn remove_primary_rules(&self, ctx: &FlowContext, node: NodeId, plan: &RouterPlan) -> TaskResult<()> {
        for rule in self.primary_rules(node, plan).iter().rev() {
            ctx.remove(node, &rule.rule_ref).await?;
        }
        Ok(())
    }

    /// Installs the redirection group, then the miss rule once the group is
    /// visible, then the default forward.
    async fn add_secondary_rules(
        &self,
        ctx: &FlowContext,
        node: NodeId,
        plan: &RouterPlan,
        primary_tep: Ipv4Addr,
    ) -> TaskResult<()> {
        let group_id = plan
            .group_id
            .ok_or_else(|| TaskError::internal(format!("router {} has no group id", plan.router.name)))?;
        ctx.install_group(&self.redirection_group(node, plan, group_id, primary_tep))
            .await?;
        ctx.install(&self.secondary_miss_rule(node, plan, group_id))
            .await?;
        ctx.install(&self.default_forward_rule(node, plan)).await
    }

    /// Inverse of [`TranslationMode::add_secondary_rules`]: rules go before
    /// the group they forward to.
    async fn remove_secondary_rules(&self, ctx: &FlowContext, node: NodeId, plan: &RouterPlan) -> TaskResult<()> {
        ctx.remove(node, &self.default_forward_rule(node, plan).rule_ref)
            .await?;
        let miss = plan
            .qualified_rule(node, self.translation_stage(), PRIORITY_MISS, "miss")
            .rule_ref;
        ctx.remove(node, &miss).await?;
        if let Some(group_id) = plan.group_id {
            ctx.remove_group(node, group_id).await?;
        }
        Ok(())
    }
}

/// Explicit field rewrite per session, installed reactively.
#[derive(Debug, Default)]
pub struct ControllerRewriteMode;

#[async_trait]
impl TranslationMode for ControllerRewriteMode {
    fn kind(&self) -> ModeKind {
        ModeKind::ControllerRewrite
    }
}

/// Connection-tracker assisted translation.
#[derive(Debug)]
pub struct ConntrackMode {
    port_range: (u16, u16),
}

impl ConntrackMode {
    pub fn new(port_range: (u16, u16)) -> Self {
        Self { port_range }
    }

    /// Allocates (or returns) the router's zone.
    pub async fn allocate_zone(ctx: &FlowContext, router: &Router) -> TaskResult<u16> {
        let zone = ctx.allocate_id(ZONE_POOL, ZONE_RANGE, &router.name).await?;
        u16::try_from(zone).map_err(|_| TaskError::internal(format!("zone {zone} out of range")))
    }

    pub fn existing_zone(ctx: &FlowContext, router: &Router) -> Option<u16> {
        ctx.allocator
            .lookup(ZONE_POOL, &router.name)
            .and_then(|zone| u16::try_from(zone).ok())
    }
}

#[async_trait]
impl TranslationMode for ConntrackMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Conntrack
    }

    fn translation_stage(&self) -> Table {
        Table::SnatConntrack
    }

    fn inbound_stage(&self) -> Table {
        Table::SnatConntrack
    }

    /// Reverse translation per external address, then one SNAT commit rule
    /// for new outbound connections using the first external address.
    fn stage_rules(&self, node: NodeId, plan: &RouterPlan) -> Vec<ForwardingRule> {
        // Teardown without a held zone only needs the rule references.
        let zone = plan.ct_zone.unwrap_or_default();
        let mut rules: Vec<ForwardingRule> = plan
            .router
            .external_ips
            .iter()
            .map(|ip| {
                plan.qualified_rule(node, Table::SnatConntrack, PRIORITY_TRANSLATION, ip.address())
                    .matching(MatchField::RouterMetadata(plan.id()))
                    .matching(MatchField::DstIp(ip.prefix))
                    .then(Action::Conntrack {
                        zone,
                        commit: false,
                        nat: None,
                    })
                    .then(Action::GotoTable(Table::Fib))
            })
            .collect();

        if let Some(first) = plan.router.external_ips.first() {
            rules.push(
                plan.qualified_rule(node, Table::SnatConntrack, PRIORITY_DEFAULT, "snat")
                    .matching(MatchField::RouterMetadata(plan.id()))
                    .then(Action::Conntrack {
                        zone,
                        commit: true,
                        nat: Some(CtNat {
                            address: first.address(),
                            port_low: self.port_range.0,
                            port_high: self.port_range.1,
                        }),
                    })
                    .then(Action::GotoTable(Table::NaptForward)),
            );
        }
        rules
    }

    /// Unmatched traffic is translated by the SNAT commit rule, nothing is
    /// punted.
    fn primary_miss_rule(&self, _node: NodeId, _plan: &RouterPlan) -> Option<ForwardingRule> {
        None
    }
}

/// Controller rewrite with VNI-tagged encapsulation across a routing domain.
#[derive(Debug, Default)]
pub struct CrossDomainMode;

#[async_trait]
impl TranslationMode for CrossDomainMode {
    fn kind(&self) -> ModeKind {
        ModeKind::CrossDomain
    }

    /// The VNI provisioned for the VPN, else one allocated for the router.
    async fn tunnel_key(&self, ctx: &FlowContext, router: &Router, vpn: Option<&str>) -> TaskResult<u32> {
        if let Some(vni) = vpn.and_then(|vpn| ctx.topology.provisioned_vni(vpn)) {
            return Ok(vni.value());
        }
        ctx.allocate_id(VNI_POOL, ctx.vni_range, &router.name).await
    }

    fn existing_tunnel_key(&self, ctx: &FlowContext, router: &Router, vpn: Option<&str>) -> Option<u32> {
        vpn.and_then(|vpn| ctx.topology.provisioned_vni(vpn))
            .map(|vni| vni.value())
            .or_else(|| ctx.allocator.lookup(VNI_POOL, &router.name))
    }

    async fn release_tunnel_key(&self, ctx: &FlowContext, router: &Router) -> TaskResult<()> {
        ctx.allocator.release(VNI_POOL, &router.name).await?;
        Ok(())
    }

    fn inbound_rule(&self, node: NodeId, plan: &RouterPlan, ip: &ExternalIp) -> ForwardingRule {
        plan.qualified_rule(node, Table::Fib, PRIORITY_TRANSLATION, ip.address())
            .matching(MatchField::TunnelKey(plan.tunnel_key))
            .matching(MatchField::DstIp(ip.prefix))
            .then(Action::SetRouterMetadata(plan.id()))
            .then(Action::GotoTable(self.inbound_stage()))
    }

    fn outbound_rule(&self, node: NodeId, plan: &RouterPlan, ip: &ExternalIp) -> ForwardingRule {
        plan.qualified_rule(node, Table::NaptForward, PRIORITY_TRANSLATION, ip.address())
            .matching(MatchField::RouterMetadata(plan.id()))
            .matching(MatchField::SrcIp(ip.prefix))
            .then(Action::SetTunnelKey(plan.tunnel_key))
            .then(Action::GotoTable(Table::Fib))
    }
}
