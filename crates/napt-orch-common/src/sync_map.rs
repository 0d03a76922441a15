//! Reference counted map that never creates entries implicitly.
//!
//! Usage counters (how many internal addresses are bound to an external IP,
//! how many routers share a node's boundary group, ...) must not spring into
//! existence because somebody looked them up. `SyncMap` keeps creation
//! explicit: lookups return `Option`, increments on a missing key fail, and
//! [`SyncMap::acquire`]/[`SyncMap::release`] pair creation and removal with
//! the count reaching one and zero.

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Reference count underflow")]
    RefCountUnderflow,
}

/// Trait for types that have a reference count.
pub trait HasRefCount {
    /// Increments the reference count and returns the new value.
    fn increment_ref(&mut self) -> u32;

    /// Decrements the reference count and returns the new value.
    ///
    /// Returns `None` if the count would underflow.
    fn decrement_ref(&mut self) -> Option<u32>;

    fn ref_count(&self) -> u32;
}

/// Plain counter for maps whose values carry nothing but the count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefCounter(u32);

impl RefCounter {
    pub fn new() -> Self {
        Self(0)
    }
}

impl HasRefCount for RefCounter {
    fn increment_ref(&mut self) -> u32 {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.0 = self.0.checked_sub(1)?;
        Some(self.0)
    }

    fn ref_count(&self) -> u32 {
        self.0
    }
}

/// A map wrapper whose accessors never auto-vivify entries.
///
/// ```
/// use napt_orch_common::{RefCounter, SyncMap};
///
/// let mut usage: SyncMap<&str, RefCounter> = SyncMap::new();
/// assert!(usage.increment_ref(&"203.0.113.5").is_err());
///
/// assert_eq!(usage.acquire("203.0.113.5", RefCounter::new), 1);
/// assert_eq!(usage.release(&"203.0.113.5"), Ok(0));
/// assert!(usage.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// **This never creates entries.**
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    /// Removes every entry for which `keep` returns false.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.retain(keep);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: HasRefCount,
{
    /// Increments the reference count for the given key.
    ///
    /// **This never creates entries.**
    pub fn increment_ref(&mut self, key: &K) -> Result<u32, SyncMapError> {
        match self.inner.get_mut(key) {
            Some(entry) => Ok(entry.increment_ref()),
            None => Err(SyncMapError::KeyNotFound),
        }
    }

    /// Decrements the reference count for the given key.
    pub fn decrement_ref(&mut self, key: &K) -> Result<u32, SyncMapError> {
        match self.inner.get_mut(key) {
            Some(entry) => entry
                .decrement_ref()
                .ok_or(SyncMapError::RefCountUnderflow),
            None => Err(SyncMapError::KeyNotFound),
        }
    }

    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|e| e.ref_count())
    }

    /// Takes one reference on `key`, creating the entry with `init` if absent.
    ///
    /// Returns the new count; 1 means the caller created the entry.
    pub fn acquire<F>(&mut self, key: K, init: F) -> u32
    where
        F: FnOnce() -> V,
    {
        self.inner.entry(key).or_insert_with(init).increment_ref()
    }

    /// Drops one reference on `key` and removes the entry once it reaches 0.
    pub fn release(&mut self, key: &K) -> Result<u32, SyncMapError> {
        let remaining = self.decrement_ref(key)?;
        if remaining == 0 {
            self.inner.remove(key);
        }
        Ok(remaining)
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_never_creates() {
        let mut map: SyncMap<String, RefCounter> = SyncMap::new();

        assert!(map.get(&"missing".to_string()).is_none());
        assert!(map.get_mut(&"missing".to_string()).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_increment_ref_requires_existing_key() {
        let mut map: SyncMap<String, RefCounter> = SyncMap::new();
        assert_eq!(
            map.increment_ref(&"missing".to_string()),
            Err(SyncMapError::KeyNotFound)
        );

        map.insert("key".to_string(), RefCounter::new());
        assert_eq!(map.increment_ref(&"key".to_string()), Ok(1));
        assert_eq!(map.increment_ref(&"key".to_string()), Ok(2));
    }

    #[test]
    fn test_decrement_ref_underflow_protection() {
        let mut map: SyncMap<String, RefCounter> = SyncMap::new();
        map.insert("key".to_string(), RefCounter::new());

        assert_eq!(
            map.decrement_ref(&"key".to_string()),
            Err(SyncMapError::RefCountUnderflow)
        );
        map.increment_ref(&"key".to_string()).unwrap();
        assert_eq!(map.decrement_ref(&"key".to_string()), Ok(0));
        // Entry stays; only release() removes at zero
        assert_eq!(map.ref_count(&"key".to_string()), Some(0));
    }

    #[test]
    fn test_acquire_release_pairs() {
        let mut map: SyncMap<u32, RefCounter> = SyncMap::new();

        assert_eq!(map.acquire(7, RefCounter::new), 1);
        assert_eq!(map.acquire(7, RefCounter::new), 2);
        assert_eq!(map.release(&7), Ok(1));
        assert_eq!(map.release(&7), Ok(0));
        assert!(!map.contains_key(&7));
        assert_eq!(map.release(&7), Err(SyncMapError::KeyNotFound));
    }

    #[test]
    fn test_retain() {
        let mut map: SyncMap<u32, RefCounter> = SyncMap::new();
        map.acquire(1, RefCounter::new);
        map.acquire(2, RefCounter::new);
        map.retain(|k, _| *k != 1);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![2]);
    }
}
