//! NaptDaemon: event loop of the NAPT control plane.
//!
//! Events arrive on a bounded channel. Hosting, tunnel endpoint and router
//! removal events go to the coordinator's keyed queues; first-packet and
//! session expiry work runs on a pool bounded by a semaphore. A heartbeat
//! drives [`Orch::on_timer`] on every component.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::config::NaptConfig;
use crate::election::PrimarySwitchElector;
use crate::flows::TranslationFlowProgrammer;
use crate::model::Router;
use crate::packet::{FirstPacketEvent, SessionExpiredEvent, TrafficEventProcessor};
use crate::pool::AddressPoolManager;
use crate::reconverge::{ReconvergenceCoordinator, RouteLedger};
use crate::services::{
    IdAllocator, MemoryIdAllocator, MemoryPacketReplayer, MemoryRouteAdvertiser,
    MemoryRuleInstaller, MemoryTopology, PacketReplayer, RouteAdvertiser, RuleInstaller,
    TopologyStore,
};
use crate::stats::NaptStats;
use napt_orch_common::Orch;
use napt_types::NodeId;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOURCE: &str = "NaptDaemon";

/// Collaborators the control plane runs against.
#[derive(Clone)]
pub struct NaptServices {
    pub topology: Arc<dyn TopologyStore>,
    pub allocator: Arc<dyn IdAllocator>,
    pub installer: Arc<dyn RuleInstaller>,
    pub advertiser: Arc<dyn RouteAdvertiser>,
    pub replayer: Arc<dyn PacketReplayer>,
}

impl NaptServices {
    /// Fresh in-memory collaborators (simulation mode).
    pub fn in_memory() -> Self {
        Self {
            topology: Arc::new(MemoryTopology::new()),
            allocator: Arc::new(MemoryIdAllocator::new()),
            installer: Arc::new(MemoryRuleInstaller::new()),
            advertiser: Arc::new(MemoryRouteAdvertiser::new()),
            replayer: Arc::new(MemoryPacketReplayer::new()),
        }
    }
}

/// Input of the daemon.
#[derive(Debug)]
pub enum NaptEvent {
    /// `router` joined or left `node`'s hosting set.
    RouterHosted {
        router: String,
        node: NodeId,
        added: bool,
    },
    TunnelEndpoint {
        node: NodeId,
        added: bool,
    },
    RouterRemoved(Router),
    FirstPacket(FirstPacketEvent),
    SessionExpired(SessionExpiredEvent),
    /// One router, or every hosted router when `None`.
    Reconcile {
        router: Option<String>,
    },
}

pub struct NaptDaemon {
    config: NaptConfig,
    stats: Arc<NaptStats>,
    pools: Arc<AddressPoolManager>,
    flows: Arc<TranslationFlowProgrammer>,
    packets: Arc<TrafficEventProcessor>,
    coordinator: Arc<ReconvergenceCoordinator>,
    orchs: Vec<Arc<dyn Orch>>,
    sender: mpsc::Sender<NaptEvent>,
    events: Option<mpsc::Receiver<NaptEvent>>,
    packet_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl NaptDaemon {
    /// Wires the five components over `services`.
    pub fn new(config: NaptConfig, services: NaptServices) -> Self {
        let stats = Arc::new(NaptStats::new());
        let pools = &config.pools;
        // Validated to fit in u16.
        let (port_low, port_high) = (
            u16::try_from(pools.port_range.low).unwrap_or(u16::MAX),
            u16::try_from(pools.port_range.high).unwrap_or(u16::MAX),
        );

        let pool_manager = Arc::new(AddressPoolManager::new(
            Arc::clone(&services.allocator),
            Arc::clone(&stats),
            port_low,
            port_high,
        ));
        let flows = Arc::new(TranslationFlowProgrammer::from_config(
            Arc::clone(&services.topology),
            Arc::clone(&services.allocator),
            Arc::clone(&services.installer),
            Arc::clone(&stats),
            &config,
        ));
        let elector = Arc::new(PrimarySwitchElector::new(
            Arc::clone(&services.topology),
            Arc::clone(&stats),
        ));
        let routes = RouteLedger::new(
            Arc::clone(&services.topology),
            Arc::clone(&services.advertiser),
            Arc::clone(&services.allocator),
            Arc::clone(&flows),
            Arc::clone(&stats),
            (pools.label_range.low, pools.label_range.high),
        );
        let coordinator = Arc::new(ReconvergenceCoordinator::new(
            Arc::clone(&services.topology),
            elector,
            Arc::clone(&flows),
            Arc::clone(&pool_manager),
            routes,
            Arc::clone(&stats),
            &config,
        ));
        let packets = Arc::new(TrafficEventProcessor::new(
            Arc::clone(&services.topology),
            Arc::clone(&pool_manager),
            Arc::clone(&flows),
            Arc::clone(&services.replayer),
            Arc::clone(&stats),
            coordinator.router_queue(),
        ));

        let (sender, events) = mpsc::channel(config.daemon.event_queue_depth.max(1));
        let orchs: Vec<Arc<dyn Orch>> = vec![
            Arc::clone(&coordinator) as Arc<dyn Orch>,
            Arc::clone(&packets) as Arc<dyn Orch>,
        ];
        for orch in &orchs {
            info!(orch = orch.name(), "registered");
        }

        Self {
            packet_permits: Arc::new(Semaphore::new(config.queue.packet_workers.max(1))),
            config,
            stats,
            pools: pool_manager,
            flows,
            packets,
            coordinator,
            orchs,
            sender,
            events: Some(events),
            shutdown: CancellationToken::new(),
        }
    }

    /// Handle for feeding events into the loop.
    pub fn sender(&self) -> mpsc::Sender<NaptEvent> {
        self.sender.clone()
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<NaptStats> {
        Arc::clone(&self.stats)
    }

    pub fn pools(&self) -> Arc<AddressPoolManager> {
        Arc::clone(&self.pools)
    }

    pub fn flows(&self) -> Arc<TranslationFlowProgrammer> {
        Arc::clone(&self.flows)
    }

    pub fn coordinator(&self) -> Arc<ReconvergenceCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn packets(&self) -> Arc<TrafficEventProcessor> {
        Arc::clone(&self.packets)
    }

    /// Runs until [`NaptDaemon::stop`] is called.
    ///
    /// Events already queued when the stop arrives are still dispatched, and
    /// the call returns once their work has finished.
    pub async fn run(&mut self) {
        let Some(mut events) = self.events.take() else {
            warn!("event loop already ran");
            return;
        };

        let heartbeat_interval = self.config.heartbeat_interval();
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, SOURCE, "event_loop_started")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "heartbeat_interval_ms": self.config.daemon.heartbeat_interval_ms,
                "orch_count": self.orchs.len(),
                "reconcile_interval_ms": self.config.daemon.reconcile_interval_ms,
            })));
        info!(?heartbeat_interval, "NAPT event loop started");

        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }

        while let Ok(event) = events.try_recv() {
            self.dispatch(event).await;
        }
        self.drain().await;

        info!(stats = ?self.stats.snapshot(), "NAPT event loop stopped");
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, SOURCE, "event_loop_stopped")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::to_value(self.stats.snapshot()).unwrap_or_default()));
    }

    /// Asks the loop to stop.
    pub fn stop(&self) {
        info!("stopping NAPT daemon");
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, SOURCE, "stop_requested")
            .with_outcome(AuditOutcome::Success));
        self.shutdown.cancel();
    }

    async fn dispatch(&self, event: NaptEvent) {
        debug!(?event, "dispatching");
        // Coordinator outcomes are logged by the queues; tickets are not
        // awaited here.
        match event {
            NaptEvent::RouterHosted {
                router,
                node,
                added,
            } => {
                self.coordinator
                    .on_router_hosted_on_node(&router, node, added);
            }
            NaptEvent::TunnelEndpoint { node, added } => {
                self.coordinator.on_tunnel_endpoint(node, added);
            }
            NaptEvent::RouterRemoved(router) => {
                self.coordinator.on_router_removed(router);
            }
            NaptEvent::Reconcile { router: Some(router) } => {
                self.coordinator.reconcile(&router);
            }
            NaptEvent::Reconcile { router: None } => {
                self.coordinator.reconcile_all();
            }
            NaptEvent::FirstPacket(event) => {
                let Ok(permit) = Arc::clone(&self.packet_permits).acquire_owned().await else {
                    return;
                };
                let packets = Arc::clone(&self.packets);
                tokio::spawn(async move {
                    let _permit = permit;
                    let (router, internal) = (event.router, event.internal);
                    if let Err(e) = packets.on_first_packet(event).await {
                        debug!(%router, %internal, status = %e.to_status(), error = %e, "first packet not translated");
                    }
                });
            }
            NaptEvent::SessionExpired(event) => {
                let Ok(permit) = Arc::clone(&self.packet_permits).acquire_owned().await else {
                    return;
                };
                let packets = Arc::clone(&self.packets);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = packets.on_session_expired(event).await {
                        warn!(router = %event.router, internal = %event.internal, error = %e, "session teardown failed");
                    }
                });
            }
        }
    }

    async fn heartbeat(&self) {
        for orch in &self.orchs {
            orch.on_timer().await;
            if orch.has_pending_tasks() {
                debug!(orch = orch.name(), pending = ?orch.dump_pending_tasks(), "pending work");
            }
        }
        debug!(stats = ?self.stats.snapshot(), "heartbeat");
    }

    /// Waits for in-flight packet work and queued coordinator work.
    async fn drain(&self) {
        let workers = u32::try_from(self.config.queue.packet_workers.max(1)).unwrap_or(u32::MAX);
        if let Ok(all) = self.packet_permits.acquire_many(workers).await {
            drop(all);
        }
        self.coordinator.wait_idle().await;
    }

    /// Dumps state for debugging.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "NaptDaemon running: {}",
            self.events.is_none() && !self.shutdown.is_cancelled()
        )];
        for orch in &self.orchs {
            lines.push(format!(
                "  {} - {} pending",
                orch.name(),
                orch.dump_pending_tasks().len()
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExternalNetwork, ProviderType};
    use napt_types::{Ipv4Prefix, MacAddress, Protocol, RouterId};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        topo: Arc<MemoryTopology>,
        installer: Arc<MemoryRuleInstaller>,
        replayer: Arc<MemoryPacketReplayer>,
        daemon: NaptDaemon,
    }

    fn fixture(config: NaptConfig) -> Fixture {
        let topo = Arc::new(MemoryTopology::new());
        let installer = Arc::new(MemoryRuleInstaller::new());
        let replayer = Arc::new(MemoryPacketReplayer::new());
        let services = NaptServices {
            topology: topo.clone(),
            allocator: Arc::new(MemoryIdAllocator::new()),
            installer: installer.clone(),
            advertiser: Arc::new(MemoryRouteAdvertiser::new()),
            replayer: replayer.clone(),
        };

        let net = ExternalNetwork {
            id: Uuid::new_v4(),
            name: "ext".into(),
            provider: ProviderType::Gre,
            vpn: "ext-vpn".into(),
        };
        topo.add_router(
            Router::new(RouterId::new(1), "r1", net.id)
                .with_external_ip("203.0.113.5/32".parse().unwrap(), Uuid::new_v4())
                .with_gateway_mac(MacAddress::new([2, 0, 0, 0, 0, 1])),
        );
        topo.add_network(net);
        topo.set_tunnel_endpoint(NodeId::new(1), Ipv4Addr::new(192, 0, 2, 1));
        topo.set_tunnel_endpoint(NodeId::new(2), Ipv4Addr::new(192, 0, 2, 2));

        Fixture {
            topo,
            installer,
            replayer,
            daemon: NaptDaemon::new(config, services),
        }
    }

    #[tokio::test]
    async fn test_hosting_events_program_nodes() {
        let f = fixture(NaptConfig::default());
        let Fixture {
            topo,
            installer,
            mut daemon,
            ..
        } = f;
        let sender = daemon.sender();
        let coordinator = daemon.coordinator();
        daemon.stop();

        for node in [1, 2] {
            topo.host_router("r1", NodeId::new(node));
            sender
                .send(NaptEvent::RouterHosted {
                    router: "r1".into(),
                    node: NodeId::new(node),
                    added: true,
                })
                .await
                .unwrap();
        }
        daemon.run().await;

        assert_eq!(topo.primary("r1").unwrap().node, NodeId::new(1));
        assert_eq!(coordinator.roles("r1").len(), 2);
        assert!(!installer.groups_on(NodeId::new(2)).is_empty());
    }

    #[tokio::test]
    async fn test_first_packet_runs_on_pool() {
        let f = fixture(NaptConfig::default());
        f.topo.host_router("r1", NodeId::new(1));
        f.topo.set_primary("r1", NodeId::new(1));
        let internal: Ipv4Prefix = "10.0.0.5/32".parse().unwrap();
        f.daemon
            .pools()
            .register_mapping(RouterId::new(1), internal, "203.0.113.5/32".parse().unwrap())
            .await
            .unwrap();

        let mut daemon = f.daemon;
        daemon
            .sender()
            .send(NaptEvent::FirstPacket(FirstPacketEvent {
                router: RouterId::new(1),
                internal: "10.0.0.5:53124".parse().unwrap(),
                protocol: Protocol::Tcp,
                node: NodeId::new(2),
                packet: vec![0x45, 0, 0, 40],
            }))
            .await
            .unwrap();
        daemon.stop();
        daemon.run().await;

        assert_eq!(f.replayer.replayed(), vec![(NodeId::new(1), vec![0x45, 0, 0, 40])]);
        assert_eq!(f.installer.rules_on(NodeId::new(1)).len(), 2);
        assert_eq!(daemon.stats().snapshot().sessions_installed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_runs_reconcile() {
        let mut config = NaptConfig::default();
        config.daemon.heartbeat_interval_ms = 100;
        config.daemon.reconcile_interval_ms = Some(250);
        let f = fixture(config);
        f.topo.host_router("r1", NodeId::new(1));

        let mut daemon = f.daemon;
        let token = daemon.shutdown_token();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            token.cancel();
        });
        daemon.run().await;
        stopper.await.unwrap();

        // Nobody reported the hosting; the sweep elected and programmed.
        assert_eq!(f.topo.primary("r1").unwrap().node, NodeId::new(1));
        assert!(!f.installer.rules_on(NodeId::new(1)).is_empty());
    }

    #[tokio::test]
    async fn test_run_twice_returns() {
        let mut daemon = fixture(NaptConfig::default()).daemon;
        daemon.stop();
        daemon.run().await;
        daemon.run().await;
        assert_eq!(daemon.dump().len(), 3);
    }
}
