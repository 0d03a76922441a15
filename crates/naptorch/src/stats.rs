//! Control-plane counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters, one instance per daemon.
#[derive(Debug, Default)]
pub struct NaptStats {
    pub elections: AtomicU64,
    pub elections_without_candidate: AtomicU64,
    pub mappings_registered: AtomicU64,
    pub mappings_released: AtomicU64,
    pub ports_allocated: AtomicU64,
    pub ports_released: AtomicU64,
    pub allocation_exhausted: AtomicU64,
    pub sessions_installed: AtomicU64,
    pub sessions_aborted: AtomicU64,
    pub sessions_ignored: AtomicU64,
    pub sessions_removed: AtomicU64,
    pub rules_installed: AtomicU64,
    pub rules_removed: AtomicU64,
    pub groups_installed: AtomicU64,
    pub groups_removed: AtomicU64,
    pub dependency_expired: AtomicU64,
    pub routes_advertised: AtomicU64,
    pub routes_withdrawn: AtomicU64,
}

/// Point-in-time copy of [`NaptStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NaptStatsSnapshot {
    pub elections: u64,
    pub elections_without_candidate: u64,
    pub mappings_registered: u64,
    pub mappings_released: u64,
    pub ports_allocated: u64,
    pub ports_released: u64,
    pub allocation_exhausted: u64,
    pub sessions_installed: u64,
    pub sessions_aborted: u64,
    pub sessions_ignored: u64,
    pub sessions_removed: u64,
    pub rules_installed: u64,
    pub rules_removed: u64,
    pub groups_installed: u64,
    pub groups_removed: u64,
    pub dependency_expired: u64,
    pub routes_advertised: u64,
    pub routes_withdrawn: u64,
}

impl NaptStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NaptStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        NaptStatsSnapshot {
            elections: get(&self.elections),
            elections_without_candidate: get(&self.elections_without_candidate),
            mappings_registered: get(&self.mappings_registered),
            mappings_released: get(&self.mappings_released),
            ports_allocated: get(&self.ports_allocated),
            ports_released: get(&self.ports_released),
            allocation_exhausted: get(&self.allocation_exhausted),
            sessions_installed: get(&self.sessions_installed),
            sessions_aborted: get(&self.sessions_aborted),
            sessions_ignored: get(&self.sessions_ignored),
            sessions_removed: get(&self.sessions_removed),
            rules_installed: get(&self.rules_installed),
            rules_removed: get(&self.rules_removed),
            groups_installed: get(&self.groups_installed),
            groups_removed: get(&self.groups_removed),
            dependency_expired: get(&self.dependency_expired),
            routes_advertised: get(&self.routes_advertised),
            routes_withdrawn: get(&self.routes_withdrawn),
        }
    }
}
