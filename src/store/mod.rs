//! Cache Store Module
//!
//! In-memory authority over the current value of every cached key.
//!
//! ## Responsibilities
//! - Serve reads without waiting on any flush
//! - Last-write-wins overwrite on every `put`
//! - Concurrent readers, exclusive writer (RwLock)
//!
//! The store never talks to the database; read-through on a miss is the
//! facade's job.

mod table;

pub use table::CacheStore;

use std::time::SystemTime;

/// A cached value with its last write time
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub last_modified: SystemTime,
}
