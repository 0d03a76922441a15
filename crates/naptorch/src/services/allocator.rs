//! Identifier allocator contract and in-memory implementation.

use super::{FailureBudget, ServiceError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Ranged integer pools keyed by (pool name, key).
///
/// Allocation is idempotent by key: asking twice with the same key returns
/// the same value, which makes concurrent identical requests converge.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Creates a pool over `[low, high]`. Creating an existing pool is a no-op.
    async fn create_pool(&self, pool: &str, low: u32, high: u32) -> Result<(), ServiceError>;

    /// Returns the value held by `key`, allocating one if needed.
    ///
    /// `Ok(None)` means the pool is exhausted.
    async fn allocate(&self, pool: &str, key: &str) -> Result<Option<u32>, ServiceError>;

    /// Releases `key`'s value. Returns whether the key held one.
    async fn release(&self, pool: &str, key: &str) -> Result<bool, ServiceError>;

    async fn delete_pool(&self, pool: &str) -> Result<(), ServiceError>;

    /// Value currently held by `key`, without allocating.
    fn lookup(&self, pool: &str, key: &str) -> Option<u32>;
}

#[derive(Debug)]
struct Pool {
    low: u32,
    high: u32,
    next: u32,
    by_key: HashMap<String, u32>,
    used: BTreeSet<u32>,
}

impl Pool {
    fn new(low: u32, high: u32) -> Self {
        Self {
            low,
            high,
            next: low,
            by_key: HashMap::new(),
            used: BTreeSet::new(),
        }
    }

    fn capacity(&self) -> u64 {
        u64::from(self.high) - u64::from(self.low) + 1
    }

    fn allocate(&mut self, key: &str) -> Option<u32> {
        if let Some(value) = self.by_key.get(key) {
            return Some(*value);
        }
        if u64::try_from(self.used.len()).unwrap_or(u64::MAX) >= self.capacity() {
            return None;
        }

        // Round-robin from the last hand-out so released values are not
        // reused immediately.
        let mut candidate = self.next;
        loop {
            if !self.used.contains(&candidate) {
                break;
            }
            candidate = if candidate == self.high {
                self.low
            } else {
                candidate + 1
            };
        }

        self.used.insert(candidate);
        self.by_key.insert(key.to_string(), candidate);
        self.next = if candidate == self.high {
            self.low
        } else {
            candidate + 1
        };
        Some(candidate)
    }

    fn release(&mut self, key: &str) -> bool {
        match self.by_key.remove(key) {
            Some(value) => {
                self.used.remove(&value);
                true
            }
            None => false,
        }
    }
}

/// In-process allocator.
#[derive(Debug, Default)]
pub struct MemoryIdAllocator {
    pools: DashMap<String, Mutex<Pool>>,
    failures: FailureBudget,
    release_failures: FailureBudget,
}

impl MemoryIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.pools.contains_key(pool)
    }

    /// Number of values currently allocated from `pool`.
    pub fn allocated(&self, pool: &str) -> usize {
        self.pools
            .get(pool)
            .map(|p| p.lock().unwrap_or_else(|e| e.into_inner()).used.len())
            .unwrap_or(0)
    }

    /// Fails the next `count` allocate calls.
    pub fn fail_next_allocations(&self, count: u32) {
        self.failures.arm(count);
    }

    /// Fails the next `count` release calls.
    pub fn fail_next_releases(&self, count: u32) {
        self.release_failures.arm(count);
    }
}

#[async_trait]
impl IdAllocator for MemoryIdAllocator {
    async fn create_pool(&self, pool: &str, low: u32, high: u32) -> Result<(), ServiceError> {
        if low > high {
            return Err(ServiceError::Rejected(format!(
                "pool {pool}: empty range {low}-{high}"
            )));
        }
        self.pools
            .entry(pool.to_string())
            .or_insert_with(|| Mutex::new(Pool::new(low, high)));
        Ok(())
    }

    async fn allocate(&self, pool: &str, key: &str) -> Result<Option<u32>, ServiceError> {
        self.failures.check("allocate")?;
        let entry = self
            .pools
            .get(pool)
            .ok_or_else(|| ServiceError::NotFound(format!("pool {pool}")))?;
        let value = entry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allocate(key);
        Ok(value)
    }

    async fn release(&self, pool: &str, key: &str) -> Result<bool, ServiceError> {
        self.release_failures.check("release")?;
        Ok(self
            .pools
            .get(pool)
            .map(|p| p.lock().unwrap_or_else(|e| e.into_inner()).release(key))
            .unwrap_or(false))
    }

    async fn delete_pool(&self, pool: &str) -> Result<(), ServiceError> {
        self.pools.remove(pool);
        Ok(())
    }

    fn lookup(&self, pool: &str, key: &str) -> Option<u32> {
        self.pools.get(pool).and_then(|p| {
            p.lock()
                .unwrap_or_else(|e| e.into_inner())
                .by_key
                .get(key)
                .copied()
        })
    }
}
