//! Route advertisement contract and in-memory implementation.

use super::journal::{Journal, JournalEntry};
use super::{FailureBudget, ServiceError};
use async_trait::async_trait;
use napt_types::Ipv4Prefix;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Who installed a route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteOrigin {
    /// Written locally by this control plane.
    Local,
    /// Learned from the routing control plane.
    Bgp,
}

/// External prefix reachability inside a VPN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRoute {
    pub vpn: String,
    pub prefix: Ipv4Prefix,
    pub next_hop: Ipv4Addr,
    /// Encapsulation service identifier (VNI or label).
    pub service_id: u32,
    pub origin: RouteOrigin,
}

#[async_trait]
pub trait RouteAdvertiser: Send + Sync {
    async fn advertise(&self, route: &ExternalRoute) -> Result<(), ServiceError>;

    /// Withdrawing an absent route succeeds.
    async fn withdraw(&self, route: &ExternalRoute) -> Result<(), ServiceError>;

    /// Current entries for a prefix in a VPN, any origin.
    fn routes(&self, vpn: &str, prefix: &Ipv4Prefix) -> Vec<ExternalRoute>;
}

#[derive(Debug, Default)]
pub struct MemoryRouteAdvertiser {
    table: Mutex<Vec<ExternalRoute>>,
    journal: Journal,
    failures: FailureBudget,
}

impl MemoryRouteAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Seeds an entry without journaling, e.g. a stale or BGP-learned route.
    pub fn seed(&self, route: ExternalRoute) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(route);
    }

    pub fn all_routes(&self) -> Vec<ExternalRoute> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fails the next `count` advertise or withdraw calls.
    pub fn fail_next_calls(&self, count: u32) {
        self.failures.arm(count);
    }
}

#[async_trait]
impl RouteAdvertiser for MemoryRouteAdvertiser {
    async fn advertise(&self, route: &ExternalRoute) -> Result<(), ServiceError> {
        self.failures.check("advertise")?;
        self.journal.record(JournalEntry::Advertise {
            vpn: route.vpn.clone(),
            prefix: route.prefix,
            next_hop: route.next_hop,
        });
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if !table.contains(route) {
            table.push(route.clone());
        }
        Ok(())
    }

    async fn withdraw(&self, route: &ExternalRoute) -> Result<(), ServiceError> {
        self.failures.check("withdraw")?;
        self.journal.record(JournalEntry::Withdraw {
            vpn: route.vpn.clone(),
            prefix: route.prefix,
            next_hop: route.next_hop,
        });
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| {
                !(r.vpn == route.vpn && r.prefix == route.prefix && r.next_hop == route.next_hop)
            });
        Ok(())
    }

    fn routes(&self, vpn: &str, prefix: &Ipv4Prefix) -> Vec<ExternalRoute> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.vpn == vpn && r.prefix == *prefix)
            .cloned()
            .collect()
    }
}
