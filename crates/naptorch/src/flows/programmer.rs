//! TranslationFlowProgrammer - installs and removes a router's rules per node.

use super::mode::{
    ConntrackMode, ControllerRewriteMode, CrossDomainMode, FlowContext, ModeKind, RouterPlan,
    TranslationMode, GROUP_POOL, ZONE_POOL,
};
use super::session::{self, Session};
use super::types::{Action, GroupKind, RedirectionGroup};
use crate::audit::{AuditCategory, AuditRecord};
use crate::audit_log;
use crate::config::{NaptConfig, TranslationModeConfig};
use crate::model::{ExternalNetwork, Router};
use crate::services::{IdAllocator, RuleInstaller, TopologyStore};
use crate::stats::NaptStats;
use napt_orch_common::{TaskError, TaskResult};
use napt_types::{NodeId, Protocol, RouterId};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const SOURCE: &str = "TranslationFlowProgrammer";

fn boundary_key(network: Uuid) -> String {
    format!("boundary:{network}")
}

/// Primary/secondary role programming across the translation modes.
pub struct TranslationFlowProgrammer {
    ctx: FlowContext,
    default_mode: TranslationModeConfig,
    controller: ControllerRewriteMode,
    conntrack: ConntrackMode,
    cross_domain: CrossDomainMode,
    session_idle_timeout: u32,
    /// Routers using each node's boundary group
    boundary_users: Mutex<HashMap<(NodeId, Uuid), BTreeSet<String>>>,
}

impl TranslationFlowProgrammer {
    pub fn new(ctx: FlowContext, default_mode: TranslationModeConfig, session_idle_timeout: u32) -> Self {
        let conntrack = ConntrackMode::new(ctx.port_range);
        Self {
            ctx,
            default_mode,
            controller: ControllerRewriteMode,
            conntrack,
            cross_domain: CrossDomainMode,
            session_idle_timeout,
            boundary_users: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        topology: Arc<dyn TopologyStore>,
        allocator: Arc<dyn IdAllocator>,
        installer: Arc<dyn RuleInstaller>,
        stats: Arc<NaptStats>,
        config: &NaptConfig,
    ) -> Self {
        let pools = &config.pools;
        let ctx = FlowContext {
            topology,
            allocator,
            installer,
            stats,
            group_wait: config.group_wait_timeout(),
            // validated to fit in u16
            port_range: (
                u16::try_from(pools.port_range.low).unwrap_or(u16::MAX),
                u16::try_from(pools.port_range.high).unwrap_or(u16::MAX),
            ),
            vni_range: (pools.vni_range.low, pools.vni_range.high),
            group_id_range: (pools.group_id_range.low, pools.group_id_range.high),
        };
        Self::new(
            ctx,
            config.translation.mode,
            config.translation.session_idle_timeout_secs,
        )
    }

    pub fn context(&self) -> &FlowContext {
        &self.ctx
    }

    pub fn mode(&self, kind: ModeKind) -> &dyn TranslationMode {
        match kind {
            ModeKind::ControllerRewrite => &self.controller,
            ModeKind::Conntrack => &self.conntrack,
            ModeKind::CrossDomain => &self.cross_domain,
        }
    }

    /// Cross-domain networks always use the VNI mode; everything else
    /// follows the configured mode.
    pub fn mode_kind(&self, network: Option<&ExternalNetwork>) -> ModeKind {
        if network.is_some_and(|n| n.provider.is_cross_domain()) {
            return ModeKind::CrossDomain;
        }
        match self.default_mode {
            TranslationModeConfig::Controller => ModeKind::ControllerRewrite,
            TranslationModeConfig::Conntrack => ModeKind::Conntrack,
        }
    }

    fn network(&self, router: &Router) -> Option<ExternalNetwork> {
        self.ctx.topology.external_network(&router.external_network_id)
    }

    /// Resolves the router's mode and allocates its identifiers.
    pub async fn plan(&self, router: &Router) -> TaskResult<RouterPlan> {
        let network = self.network(router).ok_or_else(|| {
            TaskError::not_found(format!(
                "external network {} of router {}",
                router.external_network_id, router.name
            ))
        })?;
        let kind = self.mode_kind(Some(&network));
        let tunnel_key = self
            .mode(kind)
            .tunnel_key(&self.ctx, router, Some(&network.vpn))
            .await?;
        let group_id = self
            .ctx
            .allocate_id(GROUP_POOL, self.ctx.group_id_range, &router.name)
            .await?;
        let boundary_group = if network.provider.needs_boundary_group() {
            Some(
                self.ctx
                    .allocate_id(GROUP_POOL, self.ctx.group_id_range, &boundary_key(network.id))
                    .await?,
            )
        } else {
            None
        };
        let ct_zone = match kind {
            ModeKind::Conntrack => Some(ConntrackMode::allocate_zone(&self.ctx, router).await?),
            _ => None,
        };

        Ok(RouterPlan {
            router: router.clone(),
            mode: kind,
            tunnel_key,
            group_id: Some(group_id),
            boundary_group,
            ct_zone,
        })
    }

    /// Plan from identifiers the router already holds; never allocates.
    ///
    /// Used for teardown, where the external network may already be gone.
    pub fn existing_plan(&self, router: &Router) -> RouterPlan {
        let network = self.network(router);
        let kind = self.mode_kind(network.as_ref());
        let vpn = network.as_ref().map(|n| n.vpn.as_str());
        let tunnel_key = self
            .mode(kind)
            .existing_tunnel_key(&self.ctx, router, vpn)
            .unwrap_or_else(|| router.id.value());
        let boundary_group = self
            .ctx
            .allocator
            .lookup(GROUP_POOL, &boundary_key(router.external_network_id));

        RouterPlan {
            router: router.clone(),
            mode: kind,
            tunnel_key,
            group_id: self.ctx.allocator.lookup(GROUP_POOL, &router.name),
            boundary_group,
            ct_zone: ConntrackMode::existing_zone(&self.ctx, router),
        }
    }

    /// Tunnel key (VNI in the cross-domain mode) held by the router.
    pub fn tunnel_key(&self, router: &Router) -> u32 {
        self.existing_plan(router).tunnel_key
    }

    async fn acquire_boundary(&self, node: NodeId, plan: &RouterPlan) -> TaskResult<()> {
        let Some(group_id) = plan.boundary_group else {
            return Ok(());
        };
        let mut users = self.boundary_users.lock().await;
        let mut actions = Vec::new();
        if let Some(mac) = plan.router.gateway_mac {
            actions.push(Action::SetDstMac(mac));
        }
        actions.push(Action::OutputProvider(plan.network_id()));
        let group = RedirectionGroup::new(node, group_id, GroupKind::All).with_bucket(1, actions);
        self.ctx.install_group(&group).await?;
        users
            .entry((node, plan.network_id()))
            .or_default()
            .insert(plan.router.name.clone());
        Ok(())
    }

    async fn release_boundary(&self, node: NodeId, plan: &RouterPlan) -> TaskResult<()> {
        let Some(group_id) = plan.boundary_group else {
            return Ok(());
        };
        let mut users = self.boundary_users.lock().await;
        let key = (node, plan.network_id());
        let last = match users.get_mut(&key) {
            Some(routers) => {
                routers.remove(&plan.router.name);
                routers.is_empty()
            }
            None => true,
        };
        if last {
            users.remove(&key);
            self.ctx.remove_group(node, group_id).await?;
            debug!(%node, group = group_id, "boundary group released");
        }
        Ok(())
    }

    fn audit(&self, action: &str, node: NodeId, plan: &RouterPlan, result: &TaskResult<()>) {
        audit_log!(AuditRecord::new(AuditCategory::FlowProgramming, SOURCE, action)
            .with_result(result)
            .with_object_id(plan.router.name.clone())
            .with_object_type("router")
            .with_details(serde_json::json!({
                "node": node.to_string(),
                "mode": plan.mode.as_str(),
                "tunnel_key": plan.tunnel_key,
            })));
    }

    /// Programs `node` as the router's primary.
    ///
    /// A node that still carries the secondary redirection group is cleaned
    /// of its secondary rules first.
    pub async fn add_primary(&self, node: NodeId, router: &Router) -> TaskResult<()> {
        let plan = self.plan(router).await?;
        let mode = self.mode(plan.mode);

        let result = async {
            if let Some(group_id) = plan.group_id {
                if self.ctx.installer.group_present(node, group_id) {
                    debug!(%node, router = %router.name, "clearing secondary role before primary");
                    mode.remove_secondary_rules(&self.ctx, node, &plan).await?;
                    self.release_boundary(node, &plan).await?;
                }
            }
            self.acquire_boundary(node, &plan).await?;
            mode.add_primary_rules(&self.ctx, node, &plan).await
        }
        .await;

        self.audit("add_primary_rules", node, &plan, &result);
        if result.is_ok() {
            info!(%node, router = %router.name, mode = %plan.mode, "primary rules installed");
        }
        result
    }

    pub async fn remove_primary(&self, node: NodeId, router: &Router) -> TaskResult<()> {
        let plan = self.existing_plan(router);
        let result = async {
            self.mode(plan.mode)
                .remove_primary_rules(&self.ctx, node, &plan)
                .await?;
            self.release_boundary(node, &plan).await
        }
        .await;
        self.audit("remove_primary_rules", node, &plan, &result);
        result
    }

    /// Programs `node` as a secondary redirecting to `primary`.
    pub async fn add_secondary(&self, node: NodeId, router: &Router, primary: NodeId) -> TaskResult<()> {
        let tep = self
            .ctx
            .topology
            .tunnel_endpoint(primary)
            .ok_or_else(|| TaskError::not_found(format!("tunnel endpoint of {primary}")))?;
        let plan = self.plan(router).await?;

        let result = async {
            self.acquire_boundary(node, &plan).await?;
            self.mode(plan.mode)
                .add_secondary_rules(&self.ctx, node, &plan, tep.ip)
                .await
        }
        .await;

        self.audit("add_secondary_rules", node, &plan, &result);
        if result.is_ok() {
            info!(%node, router = %router.name, %primary, "secondary rules installed");
        }
        result
    }

    pub async fn remove_secondary(&self, node: NodeId, router: &Router) -> TaskResult<()> {
        let plan = self.existing_plan(router);
        let result = async {
            self.mode(plan.mode)
                .remove_secondary_rules(&self.ctx, node, &plan)
                .await?;
            self.release_boundary(node, &plan).await
        }
        .await;
        self.audit("remove_secondary_rules", node, &plan, &result);
        result
    }

    /// Returns the router's group id and tunnel key to their pools.
    pub async fn release_router(&self, router: &Router) -> TaskResult<()> {
        let plan = self.existing_plan(router);
        self.ctx.allocator.release(GROUP_POOL, &router.name).await?;
        self.ctx.allocator.release(ZONE_POOL, &router.name).await?;
        self.mode(plan.mode)
            .release_tunnel_key(&self.ctx, router)
            .await?;

        let mut users = self.boundary_users.lock().await;
        let mut emptied = Vec::new();
        for (key, routers) in users.iter_mut() {
            if routers.remove(&router.name) && routers.is_empty() {
                emptied.push(*key);
            }
        }
        for key in emptied {
            users.remove(&key);
            if let Some(group_id) = plan.boundary_group {
                self.ctx.remove_group(key.0, group_id).await?;
            }
        }
        debug!(router = %router.name, "router identifiers released");
        Ok(())
    }

    /// Installs the inbound rewrite of a session on the primary.
    pub async fn install_session_inbound(&self, node: NodeId, session: &Session) -> TaskResult<()> {
        self.ctx
            .install(&session::inbound_rule(node, session, self.session_idle_timeout))
            .await
    }

    /// Installs the outbound rewrite of a session on the primary.
    pub async fn install_session_outbound(&self, node: NodeId, session: &Session) -> TaskResult<()> {
        self.ctx
            .install(&session::outbound_rule(node, session, self.session_idle_timeout))
            .await
    }

    /// Removes both directions of a session; absent rules are fine.
    pub async fn remove_session(
        &self,
        node: NodeId,
        router: RouterId,
        internal: SocketAddrV4,
        protocol: Protocol,
    ) -> TaskResult<()> {
        let inbound = session::inbound_ref(node, router, internal, protocol);
        let outbound = session::outbound_ref(node, router, internal, protocol);
        self.ctx.remove(node, &inbound).await?;
        self.ctx.remove(node, &outbound).await
    }
}
