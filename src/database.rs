//! Database Module
//!
//! The persistent store behind the cache. Only the contract lives here;
//! `MemoryDatabase` is an in-process implementation for tools, tests and
//! benchmarks.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::error::{CacheError, Result};

/// Key → value mapping handed to `Database::batch_set`
pub type Batch<V> = BTreeMap<String, V>;

/// Backing store contract
///
/// `batch_set` need not be all-or-nothing: any error makes the flush
/// coordinator retry the whole batch, which is safe because every call is
/// an idempotent overwrite.
pub trait Database<V>: Send + Sync + 'static {
    /// Fetch a value; `CacheError::NotFound` if absent
    fn get(&self, key: &str) -> Result<V>;

    fn set(&self, key: &str, value: V) -> Result<()>;

    fn batch_set(&self, batch: Batch<V>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// Thread-safe in-memory database
pub struct MemoryDatabase<V> {
    data: RwLock<HashMap<String, V>>,
}

impl<V> MemoryDatabase<V> {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl<V> Default for MemoryDatabase<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> Database<V> for MemoryDatabase<V> {
    fn get(&self, key: &str) -> Result<V> {
        self.data.read().get(key).cloned().ok_or(CacheError::NotFound)
    }

    fn set(&self, key: &str, value: V) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    fn batch_set(&self, batch: Batch<V>) -> Result<()> {
        self.data.write().extend(batch);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }
}
