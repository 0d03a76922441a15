//! TrafficEventProcessor - first-packet session setup and session expiry.
//!
//! A punted first packet is answered on the router's primary, in order:
//! port mapping, inbound rewrite, outbound rewrite, packet replay. Each step
//! only starts once the previous one has succeeded; any failure aborts the
//! event without retry and leaves the already committed steps in place.
//!
//! Rule work runs on the router's work queue, the one reconvergence uses,
//! so a primary move never interleaves with a session install. The primary
//! is looked up again once the item runs.

use crate::audit::{AuditCategory, AuditRecord};
use crate::audit_log;
use crate::flows::{Session, TranslationFlowProgrammer};
use crate::model::Router;
use crate::pool::AddressPoolManager;
use crate::services::{PacketReplayer, TopologyStore};
use crate::stats::NaptStats;
use async_trait::async_trait;
use dashmap::DashSet;
use napt_orch_common::{KeyedWorkQueue, Orch, TaskError, TaskResult};
use napt_types::{NodeId, Protocol, RouterId};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SOURCE: &str = "TrafficEventProcessor";

/// First packet of a connection with no translation state yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstPacketEvent {
    /// Router id, or a shared routing domain id owned by a router
    pub router: RouterId,
    pub internal: SocketAddrV4,
    pub protocol: Protocol,
    /// Node that punted the packet
    pub node: NodeId,
    pub packet: Vec<u8>,
}

/// Dataplane report that a session's rules idled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpiredEvent {
    pub router: RouterId,
    pub internal: SocketAddrV4,
    pub protocol: Protocol,
}

type PendingKey = (RouterId, SocketAddrV4);

/// Clears a pending-session entry on every exit path.
struct PendingGuard<'a> {
    pending: &'a DashSet<PendingKey>,
    key: PendingKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// Rule steps of a session, run from the router's queue.
#[derive(Clone)]
struct SessionRules {
    topology: Arc<dyn TopologyStore>,
    flows: Arc<TranslationFlowProgrammer>,
    replayer: Arc<dyn PacketReplayer>,
}

impl SessionRules {
    /// The assigned primary, if it still hosts the router with a tunnel
    /// endpoint up.
    fn live_primary(&self, router: &str) -> TaskResult<NodeId> {
        let node = self
            .topology
            .primary(router)
            .map(|a| a.node)
            .ok_or_else(|| TaskError::not_found(format!("primary of router {router}")))?;
        let hosts = self.topology.nodes_hosting(router).contains(&node);
        if !hosts || self.topology.tunnel_endpoint(node).is_none() {
            return Err(TaskError::not_found(format!(
                "live primary of router {router} ({node} is unreachable)"
            )));
        }
        Ok(node)
    }

    async fn install(&self, router: &str, session: &Session, packet: &[u8]) -> TaskResult<()> {
        let primary = self.live_primary(router)?;
        self.flows.install_session_inbound(primary, session).await?;
        self.flows.install_session_outbound(primary, session).await?;
        self.replayer
            .replay(primary, packet)
            .await
            .map_err(TaskError::from)?;
        Ok(())
    }

    async fn remove(&self, router: &str, event: SessionExpiredEvent) -> TaskResult<()> {
        let Some(primary) = self.topology.primary(router).map(|a| a.node) else {
            return Ok(());
        };
        self.flows
            .remove_session(primary, event.router, event.internal, event.protocol)
            .await
    }
}

pub struct TrafficEventProcessor {
    topology: Arc<dyn TopologyStore>,
    pools: Arc<AddressPoolManager>,
    rules: SessionRules,
    routers: KeyedWorkQueue<String>,
    stats: Arc<NaptStats>,
    pending: DashSet<PendingKey>,
}

impl TrafficEventProcessor {
    /// `routers` is the per-router queue reconvergence work runs on.
    pub fn new(
        topology: Arc<dyn TopologyStore>,
        pools: Arc<AddressPoolManager>,
        flows: Arc<TranslationFlowProgrammer>,
        replayer: Arc<dyn PacketReplayer>,
        stats: Arc<NaptStats>,
        routers: KeyedWorkQueue<String>,
    ) -> Self {
        Self {
            rules: SessionRules {
                topology: Arc::clone(&topology),
                flows,
                replayer,
            },
            topology,
            pools,
            routers,
            stats,
            pending: DashSet::new(),
        }
    }

    /// Router named by `id`, falling back to the owner of a shared routing
    /// domain with that id.
    fn resolve_router(&self, id: RouterId) -> TaskResult<Router> {
        self.topology
            .router_by_id(id)
            .or_else(|| {
                let router = self.topology.router_by_domain(id)?;
                debug!(domain = %id, router = %router.name, "resolved router through routing domain");
                Some(router)
            })
            .ok_or_else(|| TaskError::not_found(format!("router or routing domain {id}")))
    }

    fn begin(&self, key: PendingKey) -> Option<PendingGuard<'_>> {
        if !self.pending.insert(key) {
            return None;
        }
        Some(PendingGuard {
            pending: &self.pending,
            key,
        })
    }

    pub fn pending_sessions(&self) -> usize {
        self.pending.len()
    }

    /// Sets up translation for a new connection and replays its packet.
    ///
    /// Returns the external endpoint the connection was given.
    pub async fn on_first_packet(&self, event: FirstPacketEvent) -> TaskResult<SocketAddrV4> {
        let result = self.handle_first_packet(&event).await;

        match &result {
            Ok(external) => {
                NaptStats::incr(&self.stats.sessions_installed);
                info!(
                    router = %event.router,
                    internal = %event.internal,
                    protocol = %event.protocol,
                    %external,
                    "session installed"
                );
            }
            Err(TaskError::Ignored { reason }) => {
                NaptStats::incr(&self.stats.sessions_ignored);
                debug!(router = %event.router, internal = %event.internal, %reason, "first packet ignored");
            }
            Err(e) => {
                NaptStats::incr(&self.stats.sessions_aborted);
                warn!(router = %event.router, internal = %event.internal, error = %e, "session setup aborted");
            }
        }

        audit_log!(AuditRecord::new(AuditCategory::Session, SOURCE, "on_first_packet")
            .with_result(&result)
            .with_object_id(format!("{}/{}/{}", event.router, event.internal, event.protocol))
            .with_object_type("session")
            .with_details(serde_json::json!({
                "punted_by": event.node.to_string(),
                "external": result.as_ref().ok().map(|e| e.to_string()),
            })));
        result
    }

    async fn handle_first_packet(&self, event: &FirstPacketEvent) -> TaskResult<SocketAddrV4> {
        let router = self.resolve_router(event.router)?;
        if self.topology.primary(&router.name).is_none() {
            return Err(TaskError::not_found(format!("primary of router {}", router.name)));
        }

        let Some(_guard) = self.begin((router.id, event.internal)) else {
            return Err(TaskError::ignored(format!(
                "session {} on {} already pending",
                event.internal, router.name
            )));
        };

        if router.gateway_mac.is_none() {
            return Err(TaskError::not_found(format!(
                "external gateway MAC of router {}",
                router.name
            )));
        }
        let network = self
            .topology
            .external_network(&router.external_network_id)
            .ok_or_else(|| {
                TaskError::not_found(format!(
                    "external network {} of router {}",
                    router.external_network_id, router.name
                ))
            })?;
        let mode = self.rules.flows.mode_kind(Some(&network));
        if !mode.uses_sessions() {
            return Err(TaskError::ignored(format!(
                "router {} translates in the {mode} mode",
                router.name
            )));
        }

        let external = self
            .pools
            .get_external_address_mapping(router.id, event.internal, event.protocol)
            .await?
            .ok_or_else(|| TaskError::exhausted(format!("external ports of router {}", router.name)))?;

        let session = Session {
            router: router.id,
            internal: event.internal,
            external,
            protocol: event.protocol,
        };
        let rules = self.rules.clone();
        let name = router.name.clone();
        let packet = event.packet.clone();
        self.routers
            .submit_once(
                router.name.clone(),
                format!("first packet {}/{}", event.internal, event.protocol),
                move || async move { rules.install(&name, &session, &packet).await },
            )
            .wait()
            .await?;
        Ok(external)
    }

    /// Removes both rewrite rules of a session and returns its port.
    ///
    /// Absent rules and an already released port are not errors.
    pub async fn on_session_expired(&self, event: SessionExpiredEvent) -> TaskResult<()> {
        let router = self.resolve_router(event.router)?;
        let event = SessionExpiredEvent {
            router: router.id,
            ..event
        };
        let rules = self.rules.clone();
        let name = router.name.clone();
        self.routers
            .submit(
                router.name.clone(),
                format!("session expiry {}/{}", event.internal, event.protocol),
                move || {
                    let rules = rules.clone();
                    let name = name.clone();
                    async move { rules.remove(&name, event).await }
                },
            )
            .wait()
            .await?;

        match self
            .pools
            .release_ip_ext_port_mapping(router.id, event.internal, event.protocol)
            .await
        {
            Ok(external) => {
                debug!(router = %router.name, internal = %event.internal, %external, "session port released");
            }
            Err(TaskError::NotFound { .. }) => {
                debug!(router = %router.name, internal = %event.internal, "session had no port mapping");
            }
            Err(e) => return Err(e),
        }
        NaptStats::incr(&self.stats.sessions_removed);
        Ok(())
    }
}

#[async_trait]
impl Orch for TrafficEventProcessor {
    fn name(&self) -> &str {
        SOURCE
    }

    fn has_pending_tasks(&self) -> bool {
        !self.pending.is_empty()
    }

    fn dump_pending_tasks(&self) -> Vec<String> {
        self.pending
            .iter()
            .map(|key| format!("session {} on router {}", key.1, key.0))
            .collect()
    }
}
