//! Dirty Set Module
//!
//! Authoritative record of what must still be persisted.
//!
//! ## Responsibilities
//! - One record per key with unflushed data (writes coalesce in place)
//! - Priority-first, FIFO-within-priority drain order
//! - Retry counts, per-key backoff and escalation to dead-letter
//!
//! ## Ordering
//! Records are indexed by `(priority, order)` in a BTreeMap, where `order` is
//! the global counter value taken when the key entered its current bucket.
//! Draining walks that index, so the tie-break is deterministic.
//!
//! ## In-flight records
//! A drained record stays in the set, flagged in-flight, until its batch
//! outcome is committed. A write landing meanwhile bumps the record's
//! generation; committing a success for an older generation keeps the record
//! dirty so the newer value is flushed next cycle.

mod set;

pub use set::DirtySet;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Flush priority; lower numbers flush first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u32);

impl Priority {
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Unflushed state of one key
#[derive(Debug, Clone)]
pub struct DirtyRecord<V> {
    pub key: String,

    /// Latest written value (what the next flush sends)
    pub value: V,

    /// When the key became dirty
    pub first_marked_at: Instant,

    pub priority: Priority,

    /// Failed flush attempts; survives coalesced writes
    pub retry_count: u32,

    /// Durable log sequence of the latest write, when durability is on
    pub log_seq: Option<u64>,

    /// Bumped on every write to this key
    pub generation: u64,

    /// Part of a batch whose outcome is not yet known
    pub in_flight: bool,

    /// Earliest time the next flush attempt may include this key
    pub retry_at: Option<Instant>,

    order: u64,
}

/// A drained record's snapshot, as sent to the database
#[derive(Debug, Clone, PartialEq)]
pub struct FlushItem<V> {
    pub key: String,
    pub value: V,
    pub priority: Priority,
    pub generation: u64,
    pub log_seq: Option<u64>,
}

/// Records drained for one flush cycle, in drain order
#[derive(Debug, Clone)]
pub struct FlushBatch<V> {
    pub items: Vec<FlushItem<V>>,
}

impl<V> FlushBatch<V> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.key.as_str())
    }

    /// Split into per-priority groups, most urgent first
    pub fn into_groups(self) -> Vec<(Priority, Vec<FlushItem<V>>)> {
        let mut groups: Vec<(Priority, Vec<FlushItem<V>>)> = Vec::new();
        for item in self.items {
            match groups.last_mut() {
                Some((priority, items)) if *priority == item.priority => items.push(item),
                _ => groups.push((item.priority, vec![item])),
            }
        }
        groups
    }
}

/// A write whose flush failed more than `max_retries` times
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter<V> {
    pub key: String,

    /// Latest value; still correct in the cache store and durable log
    pub value: V,

    pub attempts: u32,
    pub last_error: String,
    pub log_seq: Option<u64>,
}

impl<V> DeadLetter<V> {
    /// The error an operator sees for this key
    pub fn error(&self) -> CacheError {
        CacheError::RetriesExhausted {
            key: self.key.clone(),
            attempts: self.attempts,
        }
    }
}

/// What happened to a record after a failed flush
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<V> {
    /// Back in the set, eligible again at `retry_at`
    Requeued {
        key: String,
        retry_count: u32,
        retry_at: Instant,
    },

    /// Removed from the set and surfaced as dead-letter
    Escalated(DeadLetter<V>),
}
