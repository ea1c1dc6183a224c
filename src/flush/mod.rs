//! Flush Coordinator Module
//!
//! Drives asynchronous persistence of dirty data to the database.
//!
//! ## Architecture
//! ```text
//!   tick (flush_interval) ──┐
//!   force_flush / shutdown ─┼──► FlushCoordinator (one cycle at a time)
//!                           │        │ drain_batch (lock held briefly)
//!                           │        ▼
//!                           │    per-priority groups ──► deferkv-db thread
//!                           │        │                   (batch_set, FIFO)
//!                           │        ▼  wait ≤ flush_timeout
//!                           └──► complete / requeue / escalate
//! ```
//!
//! Database calls run on a single dedicated thread so that a timed-out call
//! which eventually lands can never overwrite a newer value sent later.

mod coordinator;
mod worker;

pub use coordinator::{DeleteOutcome, FlushCoordinator, FlushStats};
pub use worker::FlushWorker;

pub use crate::dirty::{DeadLetter, RetryOutcome};

/// Outcome counts for one or more flush cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Keys confirmed written to the database
    pub flushed: usize,

    /// Keys returned to the dirty set after a failure
    pub requeued: usize,

    /// Keys moved to dead-letter
    pub escalated: usize,

    /// `batch_set` calls made
    pub batches: usize,

    /// `batch_set` calls that failed or timed out
    pub failed_batches: usize,
}

impl FlushReport {
    pub fn merge(&mut self, other: FlushReport) {
        self.flushed += other.flushed;
        self.requeued += other.requeued;
        self.escalated += other.escalated;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
    }

    pub fn is_clean(&self) -> bool {
        self.failed_batches == 0
    }
}
