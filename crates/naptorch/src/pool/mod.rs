//! AddressPoolManager - external address and port allocation.
//!
//! An association binds a router's internal address (or prefix) to one
//! external address or external subnet. Each external address has its own
//! port pool in the identifier allocator, named after the address. Port
//! mappings are handed out lazily from those pools on first translation
//! request and are idempotent per (router, internal ip:port, protocol).
//!
//! Usage counters count associations per pool key (the external address, or
//! the low address of an external subnet). When the last association for a
//! key goes away the pools behind it are deleted. Creating or deleting pools
//! and moving a usage count happen under one lifecycle lock, since routers
//! sharing an external address are not serialized by any router queue.

use crate::audit::{AuditCategory, AuditRecord};
use crate::audit_log;
use crate::services::IdAllocator;
use crate::stats::NaptStats;
use dashmap::DashMap;
use napt_orch_common::{RefCounter, SyncMap, TaskError, TaskResult};
use napt_types::{Ipv4Prefix, Protocol, RouterId};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const SOURCE: &str = "AddressPoolManager";

type PortKey = (RouterId, SocketAddrV4, Protocol);

/// Port pool name for one external address.
pub fn port_pool_name(external: Ipv4Addr) -> String {
    external.to_string()
}

/// Usage key of an external address or subnet.
pub fn pool_key(external: &Ipv4Prefix) -> Ipv4Addr {
    if external.is_host_route() {
        external.address()
    } else {
        external.network()
    }
}

fn allocation_key(router: RouterId, internal: SocketAddrV4, protocol: Protocol) -> String {
    format!("{}:{}:{}:{}", router, internal.ip(), internal.port(), protocol)
}

pub struct AddressPoolManager {
    allocator: Arc<dyn IdAllocator>,
    stats: Arc<NaptStats>,
    port_low: u16,
    port_high: u16,
    /// (router, internal prefix) -> external address or subnet
    associations: DashMap<(RouterId, Ipv4Prefix), Ipv4Prefix>,
    usage: Mutex<SyncMap<Ipv4Addr, RefCounter>>,
    port_mappings: DashMap<PortKey, SocketAddrV4>,
    /// Ports in use per internal address, kept alongside `port_mappings`
    internal_ports: DashMap<(RouterId, Ipv4Addr), BTreeSet<(u16, Protocol)>>,
    /// Pools created past the first address of a subnet, per pool key
    spill_pools: DashMap<Ipv4Addr, BTreeSet<Ipv4Addr>>,
    lifecycle: AsyncMutex<()>,
}

impl AddressPoolManager {
    pub fn new(
        allocator: Arc<dyn IdAllocator>,
        stats: Arc<NaptStats>,
        port_low: u16,
        port_high: u16,
    ) -> Self {
        Self {
            allocator,
            stats,
            port_low,
            port_high,
            associations: DashMap::new(),
            usage: Mutex::new(SyncMap::new()),
            port_mappings: DashMap::new(),
            internal_ports: DashMap::new(),
            spill_pools: DashMap::new(),
            lifecycle: AsyncMutex::new(()),
        }
    }

    fn usage_map(&self) -> MutexGuard<'_, SyncMap<Ipv4Addr, RefCounter>> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.port_low, self.port_high)
    }

    /// Binds `internal` to `external` for `router` and takes one usage
    /// reference on the external pool key.
    ///
    /// Registering the same association again changes nothing.
    pub async fn register_mapping(
        &self,
        router: RouterId,
        internal: Ipv4Prefix,
        external: Ipv4Prefix,
    ) -> TaskResult<()> {
        let key = pool_key(&external);
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(existing) = self.associations.get(&(router, internal)).map(|e| *e) {
            if existing == external {
                debug!(%router, %internal, %external, "association already registered");
                return Ok(());
            }
            return Err(TaskError::invalid_entry(format!(
                "{internal} on router {router} already maps to {existing}"
            )));
        }

        let result = self
            .allocator
            .create_pool(
                &port_pool_name(key),
                u32::from(self.port_low),
                u32::from(self.port_high),
            )
            .await
            .map_err(TaskError::from);

        audit_log!(
            AuditRecord::new(AuditCategory::AddressMapping, SOURCE, "register_mapping")
                .with_result(&result)
                .with_object_id(format!("{router}/{internal}"))
                .with_object_type("address_mapping")
                .with_details(serde_json::json!({
                    "external": external.to_string(),
                    "pool": key.to_string(),
                }))
        );
        result?;

        self.associations.insert((router, internal), external);
        let count = self.usage_map().acquire(key, RefCounter::new);
        NaptStats::incr(&self.stats.mappings_registered);
        info!(%router, %internal, %external, usage = count, "address mapping registered");
        Ok(())
    }

    /// External address bound to `internal`.
    pub fn association(&self, router: RouterId, internal: &Ipv4Prefix) -> Option<Ipv4Prefix> {
        self.associations.get(&(router, *internal)).map(|e| *e)
    }

    /// Finds the association covering `ip`: an exact host entry first, then
    /// the longest registered prefix containing it.
    fn resolve_association(&self, router: RouterId, ip: Ipv4Addr) -> Option<Ipv4Prefix> {
        if let Some(external) = self.associations.get(&(router, Ipv4Prefix::host(ip))) {
            return Some(*external);
        }
        self.associations
            .iter()
            .filter(|e| e.key().0 == router && e.key().1.contains(ip))
            .max_by_key(|e| e.key().1.prefix_len())
            .map(|e| *e.value())
    }

    /// Returns the external endpoint for `internal`, allocating a port on
    /// first request.
    ///
    /// `Ok(None)` means there is no association for the address or every
    /// candidate external address is out of ports.
    pub async fn get_external_address_mapping(
        &self,
        router: RouterId,
        internal: SocketAddrV4,
        protocol: Protocol,
    ) -> TaskResult<Option<SocketAddrV4>> {
        let key = (router, internal, protocol);
        if let Some(existing) = self.port_mappings.get(&key) {
            return Ok(Some(*existing));
        }

        let Some(external) = self.resolve_association(router, *internal.ip()) else {
            debug!(%router, %internal, "no external association for internal address");
            return Ok(None);
        };

        let alloc_key = allocation_key(router, internal, protocol);
        // The first candidate's pool was created at registration.
        for (idx, candidate) in external.addresses().enumerate() {
            let pool = port_pool_name(candidate);
            if idx > 0 {
                self.ensure_spill_pool(&external, candidate).await?;
            }

            let Some(port) = self.allocator.allocate(&pool, &alloc_key).await? else {
                debug!(%router, %candidate, "external address out of ports, trying next");
                continue;
            };
            let port = u16::try_from(port)
                .map_err(|_| TaskError::internal(format!("port {port} out of range")))?;

            let mapped = SocketAddrV4::new(candidate, port);
            let mapped = *self.port_mappings.entry(key).or_insert(mapped);
            self.internal_ports
                .entry((router, *internal.ip()))
                .or_default()
                .insert((internal.port(), protocol));

            NaptStats::incr(&self.stats.ports_allocated);
            debug!(%router, %internal, %protocol, external = %mapped, "port mapping allocated");
            return Ok(Some(mapped));
        }

        NaptStats::incr(&self.stats.allocation_exhausted);
        warn!(%router, %internal, %external, "all external addresses exhausted");
        Ok(None)
    }

    /// Creates the pool of a subnet address past the first one, unless the
    /// association was released meanwhile.
    async fn ensure_spill_pool(&self, external: &Ipv4Prefix, candidate: Ipv4Addr) -> TaskResult<()> {
        let key = pool_key(external);
        if self
            .spill_pools
            .get(&key)
            .is_some_and(|created| created.contains(&candidate))
        {
            return Ok(());
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.usage(key) == 0 {
            return Err(TaskError::not_found(format!("external pool {key}")));
        }
        self.allocator
            .create_pool(
                &port_pool_name(candidate),
                u32::from(self.port_low),
                u32::from(self.port_high),
            )
            .await?;
        self.spill_pools.entry(key).or_default().insert(candidate);
        debug!(%external, %candidate, "spill pool created");
        Ok(())
    }

    /// Existing port mapping, without allocating.
    pub fn lookup(
        &self,
        router: RouterId,
        internal: SocketAddrV4,
        protocol: Protocol,
    ) -> Option<SocketAddrV4> {
        self.port_mappings.get(&(router, internal, protocol)).map(|e| *e)
    }

    /// Internal endpoints of `router` that hold a port mapping.
    pub fn port_mappings(&self, router: RouterId) -> Vec<(SocketAddrV4, Protocol)> {
        let mut sessions: Vec<(SocketAddrV4, Protocol)> = self
            .port_mappings
            .iter()
            .filter(|e| e.key().0 == router)
            .map(|e| (e.key().1, e.key().2))
            .collect();
        sessions.sort();
        sessions
    }

    /// Ports currently mapped for one internal address.
    pub fn internal_ports(&self, router: RouterId, ip: Ipv4Addr) -> Vec<(u16, Protocol)> {
        self.internal_ports
            .get(&(router, ip))
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of associations sharing the external pool key of `external`.
    pub fn usage(&self, external: Ipv4Addr) -> u32 {
        self.usage_map().ref_count(&external).unwrap_or(0)
    }

    /// Releases one port mapping and returns the external endpoint it held.
    ///
    /// The mapping stays recorded until the allocator has taken the port
    /// back, so a failed release can be retried.
    pub async fn release_ip_ext_port_mapping(
        &self,
        router: RouterId,
        internal: SocketAddrV4,
        protocol: Protocol,
    ) -> TaskResult<SocketAddrV4> {
        let key = (router, internal, protocol);
        let not_found = || {
            TaskError::not_found(format!("port mapping {internal}/{protocol} on router {router}"))
        };
        let external = self.port_mappings.get(&key).map(|e| *e).ok_or_else(not_found)?;

        self.allocator
            .release(
                &port_pool_name(*external.ip()),
                &allocation_key(router, internal, protocol),
            )
            .await?;
        // Released concurrently by another caller
        if self.port_mappings.remove(&key).is_none() {
            return Err(not_found());
        }

        let remove_entry = self
            .internal_ports
            .get_mut(&(router, *internal.ip()))
            .map(|mut ports| {
                ports.remove(&(internal.port(), protocol));
                ports.is_empty()
            })
            .unwrap_or(false);
        if remove_entry {
            self.internal_ports
                .remove_if(&(router, *internal.ip()), |_, ports| ports.is_empty());
        }

        NaptStats::incr(&self.stats.ports_released);
        debug!(%router, %internal, %protocol, %external, "port mapping released");
        Ok(external)
    }

    /// Removes the association for `internal`, the port mappings under it
    /// and one usage reference on its external pool key.
    ///
    /// The association is dropped last; on failure it is still there for
    /// a retry.
    pub async fn release_address_mapping(
        &self,
        router: RouterId,
        internal: Ipv4Prefix,
    ) -> TaskResult<Ipv4Prefix> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(external) = self.associations.get(&(router, internal)).map(|e| *e) else {
            return Err(TaskError::not_found(format!(
                "address mapping {internal} on router {router}"
            )));
        };

        let result = self.release_association(router, internal, external).await;
        audit_log!(
            AuditRecord::new(AuditCategory::AddressMapping, SOURCE, "release_address_mapping")
                .with_result(&result)
                .with_object_id(format!("{router}/{internal}"))
                .with_object_type("address_mapping")
                .with_details(serde_json::json!({ "external": external.to_string() }))
        );
        result.map(|_| external)
    }

    async fn release_association(
        &self,
        router: RouterId,
        internal: Ipv4Prefix,
        external: Ipv4Prefix,
    ) -> TaskResult<()> {
        let ports: Vec<PortKey> = self
            .port_mappings
            .iter()
            .filter(|e| e.key().0 == router && internal.contains(*e.key().1.ip()))
            .map(|e| *e.key())
            .collect();
        for (router, addr, protocol) in ports {
            match self.release_ip_ext_port_mapping(router, addr, protocol).await {
                // Released concurrently by a session expiry
                Ok(_) | Err(TaskError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let key = pool_key(&external);
        let held = self
            .usage_map()
            .ref_count(&key)
            .ok_or_else(|| TaskError::internal(format!("no usage recorded for {key}")))?;
        if held == 1 {
            self.delete_pools(key).await?;
        }
        let remaining = self
            .usage_map()
            .release(&key)
            .map_err(|e| TaskError::internal(format!("usage of {key}: {e}")))?;
        self.associations.remove(&(router, internal));
        NaptStats::incr(&self.stats.mappings_released);
        info!(%router, %internal, %external, usage = remaining, "address mapping released");
        Ok(())
    }

    /// Deletes the pool of `key` and the spill pools created under it.
    async fn delete_pools(&self, key: Ipv4Addr) -> TaskResult<()> {
        self.allocator.delete_pool(&port_pool_name(key)).await?;
        let spilled: Vec<Ipv4Addr> = self
            .spill_pools
            .get(&key)
            .map(|created| created.iter().copied().collect())
            .unwrap_or_default();
        for addr in spilled {
            self.allocator.delete_pool(&port_pool_name(addr)).await?;
        }
        self.spill_pools.remove(&key);
        Ok(())
    }

    /// Tears down every association and port mapping of `router`.
    ///
    /// Returns the number of associations removed.
    pub async fn remove_mapping(&self, router: RouterId) -> TaskResult<usize> {
        let internals: Vec<Ipv4Prefix> = self
            .associations
            .iter()
            .filter(|e| e.key().0 == router)
            .map(|e| e.key().1)
            .collect();

        let mut removed = 0;
        for internal in internals {
            match self.release_address_mapping(router, internal).await {
                Ok(_) => removed += 1,
                Err(TaskError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        // Mappings whose association was already gone
        let orphans: Vec<PortKey> = self
            .port_mappings
            .iter()
            .filter(|e| e.key().0 == router)
            .map(|e| *e.key())
            .collect();
        for (router, addr, protocol) in orphans {
            match self.release_ip_ext_port_mapping(router, addr, protocol).await {
                Ok(_) | Err(TaskError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if removed > 0 {
            info!(%router, associations = removed, "router mappings removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryIdAllocator;
    use pretty_assertions::assert_eq;

    fn manager(low: u16, high: u16) -> (Arc<MemoryIdAllocator>, AddressPoolManager) {
        let alloc = Arc::new(MemoryIdAllocator::new());
        let pools = AddressPoolManager::new(alloc.clone(), Arc::new(NaptStats::new()), low, high);
        (alloc, pools)
    }

    fn prefix(s: &str) -> Ipv4Prefix {
        s.parse().unwrap()
    }

    fn sock(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    const R1: RouterId = RouterId::new(1);

    #[tokio::test]
    async fn test_mapping_is_idempotent() {
        let (_, pools) = manager(49152, 65535);
        pools
            .register_mapping(R1, prefix("10.0.0.5"), prefix("203.0.113.5"))
            .await
            .unwrap();

        let first = pools
            .get_external_address_mapping(R1, sock("10.0.0.5:53124"), Protocol::Tcp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*first.ip(), Ipv4Addr::new(203, 0, 113, 5));
        assert!((49152..=65535).contains(&first.port()));

        let again = pools
            .get_external_address_mapping(R1, sock("10.0.0.5:53124"), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(again, Some(first));
        assert_eq!(
            pools.internal_ports(R1, Ipv4Addr::new(10, 0, 0, 5)),
            vec![(53124, Protocol::Tcp)]
        );
    }

    #[tokio::test]
    async fn test_register_twice_counts_once() {
        let (alloc, pools) = manager(49152, 65535);
        let ext = prefix("203.0.113.5");
        pools.register_mapping(R1, prefix("10.0.0.5"), ext).await.unwrap();
        pools.register_mapping(R1, prefix("10.0.0.5"), ext).await.unwrap();
        assert_eq!(pools.usage(ext.address()), 1);
        assert!(alloc.has_pool("203.0.113.5"));

        let conflict = pools
            .register_mapping(R1, prefix("10.0.0.5"), prefix("203.0.113.6"))
            .await;
        assert!(matches!(conflict, Err(TaskError::InvalidEntry { .. })));
    }

    #[tokio::test]
    async fn test_release_restores_usage() {
        let (alloc, pools) = manager(49152, 65535);
        let ext = prefix("203.0.113.5");
        pools.register_mapping(R1, prefix("10.0.0.9"), ext).await.unwrap();
        let before = pools.usage(ext.address());

        pools.register_mapping(R1, prefix("10.0.0.5"), ext).await.unwrap();
        pools
            .get_external_address_mapping(R1, sock("10.0.0.5:4000"), Protocol::Udp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alloc.allocated("203.0.113.5"), 1);

        pools.release_address_mapping(R1, prefix("10.0.0.5")).await.unwrap();
        assert_eq!(pools.usage(ext.address()), before);
        assert_eq!(alloc.allocated("203.0.113.5"), 0);
        assert!(pools.lookup(R1, sock("10.0.0.5:4000"), Protocol::Udp).is_none());
    }

    #[tokio::test]
    async fn test_last_release_deletes_pool() {
        let (alloc, pools) = manager(49152, 65535);
        pools
            .register_mapping(R1, prefix("10.0.0.5"), prefix("203.0.113.5"))
            .await
            .unwrap();
        pools.release_address_mapping(R1, prefix("10.0.0.5")).await.unwrap();
        assert_eq!(pools.usage(Ipv4Addr::new(203, 0, 113, 5)), 0);
        assert!(!alloc.has_pool("203.0.113.5"));
    }

    #[tokio::test]
    async fn test_release_without_mapping_fails_cleanly() {
        let (_, pools) = manager(49152, 65535);
        let err = pools
            .release_address_mapping(R1, prefix("10.0.0.5"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));

        let err = pools
            .release_ip_ext_port_mapping(R1, sock("10.0.0.5:1"), Protocol::Tcp)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_no_association_is_none() {
        let (_, pools) = manager(49152, 65535);
        let got = pools
            .get_external_address_mapping(R1, sock("10.9.9.9:80"), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_none() {
        let (_, pools) = manager(50000, 50001);
        pools
            .register_mapping(R1, prefix("10.0.0.0/24"), prefix("203.0.113.5"))
            .await
            .unwrap();

        for port in [1000, 1001] {
            assert!(pools
                .get_external_address_mapping(R1, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), port), Protocol::Tcp)
                .await
                .unwrap()
                .is_some());
        }
        let exhausted = pools
            .get_external_address_mapping(R1, sock("10.0.0.5:1002"), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(exhausted, None);
    }

    #[tokio::test]
    async fn test_subnet_spills_to_next_address() {
        let (alloc, pools) = manager(50000, 50000);
        pools
            .register_mapping(R1, prefix("10.0.0.0/24"), prefix("198.51.100.0/30"))
            .await
            .unwrap();
        assert!(alloc.has_pool("198.51.100.0"));
        assert!(!alloc.has_pool("198.51.100.1"));

        let a = pools
            .get_external_address_mapping(R1, sock("10.0.0.5:1"), Protocol::Tcp)
            .await
            .unwrap()
            .unwrap();
        let b = pools
            .get_external_address_mapping(R1, sock("10.0.0.6:1"), Protocol::Tcp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a, sock("198.51.100.0:50000"));
        assert_eq!(b, sock("198.51.100.1:50000"));
        assert!(alloc.has_pool("198.51.100.1"));

        // Subnet usage is keyed by its low address
        assert_eq!(pools.usage(Ipv4Addr::new(198, 51, 100, 0)), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_ports() {
        let (_, pools) = manager(49152, 65535);
        let pools = Arc::new(pools);
        pools
            .register_mapping(R1, prefix("10.0.0.0/24"), prefix("203.0.113.5"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..64u16 {
            let pools = pools.clone();
            handles.push(tokio::spawn(async move {
                let proto = if i % 2 == 0 { Protocol::Tcp } else { Protocol::Udp };
                pools
                    .get_external_address_mapping(
                        R1,
                        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 1000 + i),
                        proto,
                    )
                    .await
            }));
        }

        let mut ports = BTreeSet::new();
        for handle in handles {
            let mapped = handle.await.unwrap().unwrap().unwrap();
            assert!((49152..=65535).contains(&mapped.port()));
            ports.insert(mapped.port());
        }
        assert_eq!(ports.len(), 64);
    }

    #[tokio::test]
    async fn test_allocator_failure_is_retryable() {
        let (alloc, pools) = manager(49152, 65535);
        pools
            .register_mapping(R1, prefix("10.0.0.5"), prefix("203.0.113.5"))
            .await
            .unwrap();
        alloc.fail_next_allocations(1);

        let err = pools
            .get_external_address_mapping(R1, sock("10.0.0.5:80"), Protocol::Tcp)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(pools.lookup(R1, sock("10.0.0.5:80"), Protocol::Tcp).is_none());
    }

    #[tokio::test]
    async fn test_remove_mapping_tears_down_router() {
        let (alloc, pools) = manager(49152, 65535);
        let r2 = RouterId::new(2);
        pools
            .register_mapping(R1, prefix("10.0.0.5"), prefix("203.0.113.5"))
            .await
            .unwrap();
        pools
            .register_mapping(R1, prefix("10.0.1.0/24"), prefix("203.0.113.5"))
            .await
            .unwrap();
        pools
            .register_mapping(r2, prefix("10.0.0.5"), prefix("203.0.113.6"))
            .await
            .unwrap();
        pools
            .get_external_address_mapping(R1, sock("10.0.1.7:22"), Protocol::Tcp)
            .await
            .unwrap();

        assert_eq!(pools.remove_mapping(R1).await.unwrap(), 2);
        assert_eq!(pools.usage(Ipv4Addr::new(203, 0, 113, 5)), 0);
        assert!(!alloc.has_pool("203.0.113.5"));
        assert!(pools.association(r2, &prefix("10.0.0.5")).is_some());
        assert_eq!(pools.remove_mapping(R1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_port_release_keeps_mapping() {
        let (alloc, pools) = manager(49152, 65535);
        pools
            .register_mapping(R1, prefix("10.0.0.5"), prefix("203.0.113.5"))
            .await
            .unwrap();
        let mapped = pools
            .get_external_address_mapping(R1, sock("10.0.0.5:80"), Protocol::Tcp)
            .await
            .unwrap()
            .unwrap();

        alloc.fail_next_releases(1);
        let err = pools
            .release_ip_ext_port_mapping(R1, sock("10.0.0.5:80"), Protocol::Tcp)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(pools.lookup(R1, sock("10.0.0.5:80"), Protocol::Tcp), Some(mapped));
        assert_eq!(alloc.allocated("203.0.113.5"), 1);

        let released = pools
            .release_ip_ext_port_mapping(R1, sock("10.0.0.5:80"), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(released, mapped);
        assert_eq!(alloc.allocated("203.0.113.5"), 0);
        assert!(pools.internal_ports(R1, Ipv4Addr::new(10, 0, 0, 5)).is_empty());
    }

    #[tokio::test]
    async fn test_failed_address_release_can_be_retried() {
        let (alloc, pools) = manager(49152, 65535);
        let ext = prefix("203.0.113.5");
        pools.register_mapping(R1, prefix("10.0.0.5"), ext).await.unwrap();
        pools
            .get_external_address_mapping(R1, sock("10.0.0.5:80"), Protocol::Udp)
            .await
            .unwrap()
            .unwrap();

        alloc.fail_next_releases(1);
        assert!(pools.release_address_mapping(R1, prefix("10.0.0.5")).await.is_err());
        assert_eq!(pools.association(R1, &prefix("10.0.0.5")), Some(ext));
        assert_eq!(pools.usage(ext.address()), 1);
        assert!(alloc.has_pool("203.0.113.5"));

        pools.release_address_mapping(R1, prefix("10.0.0.5")).await.unwrap();
        assert_eq!(pools.association(R1, &prefix("10.0.0.5")), None);
        assert_eq!(pools.usage(ext.address()), 0);
        assert!(!alloc.has_pool("203.0.113.5"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_external_address_survives_concurrent_churn() {
        let (alloc, pools) = manager(49152, 65535);
        let pools = Arc::new(pools);
        let ext = prefix("203.0.113.5");
        let r2 = RouterId::new(2);

        for round in 0..50u16 {
            pools.register_mapping(r2, prefix("10.0.9.1"), ext).await.unwrap();

            let register = {
                let pools = pools.clone();
                tokio::spawn(async move { pools.register_mapping(R1, prefix("10.0.0.5"), ext).await })
            };
            let release = {
                let pools = pools.clone();
                tokio::spawn(async move { pools.release_address_mapping(r2, prefix("10.0.9.1")).await })
            };
            register.await.unwrap().unwrap();
            release.await.unwrap().unwrap();

            assert_eq!(pools.usage(ext.address()), 1, "round {round}");
            assert!(alloc.has_pool("203.0.113.5"), "round {round}");
            let mapped = pools
                .get_external_address_mapping(R1, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 1000 + round), Protocol::Tcp)
                .await
                .unwrap();
            assert!(mapped.is_some(), "round {round}");

            pools.release_address_mapping(R1, prefix("10.0.0.5")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_wide_subnet_deletes_only_created_pools() {
        let (alloc, pools) = manager(50000, 50000);
        pools
            .register_mapping(R1, prefix("10.0.0.0/24"), prefix("100.0.0.0/8"))
            .await
            .unwrap();

        for host in 1..=3u8 {
            let mapped = pools
                .get_external_address_mapping(R1, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, host), 1), Protocol::Tcp)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(*mapped.ip(), Ipv4Addr::new(100, 0, 0, host - 1));
        }
        assert!(alloc.has_pool("100.0.0.2"));
        assert!(!alloc.has_pool("100.0.0.3"));

        pools.release_address_mapping(R1, prefix("10.0.0.0/24")).await.unwrap();
        for addr in ["100.0.0.0", "100.0.0.1", "100.0.0.2"] {
            assert!(!alloc.has_pool(addr), "{addr}");
        }
    }
}
