//! CacheStore implementation
//!
//! HashMap-based store with RwLock for concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;

use super::CacheEntry;

/// In-memory key → value map serving reads
pub struct CacheStore<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,

    /// Bumped by every `remove`, under the write lock
    removals: AtomicU64,
}

impl<V: Clone> CacheStore<V> {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            removals: AtomicU64::new(0),
        }
    }

    /// Unconditionally overwrite the value for a key
    pub fn put(&self, key: &str, value: V) {
        let entry = CacheEntry {
            value,
            last_modified: SystemTime::now(),
        };
        self.entries.write().insert(key.to_string(), entry);
    }

    /// Current value for a key, if cached
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).map(|entry| entry.value.clone())
    }

    /// Current entry (value and write time) for a key
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.read().get(key).cloned()
    }

    /// Snapshot to pass to `put_if_absent`; take it before reading the database
    pub fn removal_epoch(&self) -> u64 {
        self.removals.load(Ordering::Acquire)
    }

    /// Insert only if the key is absent and nothing was removed since `epoch`
    /// (read-through population)
    ///
    /// Returns the value to serve: the existing one if a write raced ahead
    /// of the database read, otherwise `value`. A `value` read before a
    /// concurrent remove is returned but not cached.
    pub fn put_if_absent(&self, key: &str, value: V, epoch: u64) -> V {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(key) {
            return existing.value.clone();
        }
        if self.removals.load(Ordering::Acquire) != epoch {
            return value;
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                last_modified: SystemTime::now(),
            },
        );
        value
    }

    /// Remove a key
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.write();
        self.removals.fetch_add(1, Ordering::AcqRel);
        entries.remove(key).map(|entry| entry.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V: Clone> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
