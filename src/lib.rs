//! # deferkv
//!
//! A write-back (write-behind) key-value cache with:
//! - Low-latency writes acknowledged from memory
//! - Write coalescing: one pending flush per key, latest value wins
//! - Priority-ordered, batched background flushing
//! - Bounded retries with per-key backoff and a dead-letter channel
//! - A write-ahead log for crash recovery of unflushed writes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WriteBackCache                            │
//! │        set / get / delete / force_flush / shutdown           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┼─────────────────┐
//!          │            │                 │
//!          ▼            ▼                 ▼
//!   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!   │ Durable Log │ │ CacheStore  │ │  DirtySet   │
//!   │  (Append)   │ │  (RwLock)   │ │ (priority)  │
//!   └─────────────┘ └─────────────┘ └──────┬──────┘
//!          ▲                               │ drain
//!          │ mark flushed                  ▼
//!          │                       ┌──────────────────┐
//!          └───────────────────────│ FlushCoordinator │
//!                                  │ (timer + force)  │
//!                                  └────────┬─────────┘
//!                                           ▼
//!                                    ┌─────────────┐
//!                                    │  Database   │
//!                                    └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod wal;
pub mod store;
pub mod dirty;
pub mod database;
pub mod flush;
pub mod cache;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CacheError, Result};
pub use config::Config;
pub use cache::{CacheStats, RecoveryReport, ShutdownReport, WriteBackCache};
pub use database::{Batch, Database, MemoryDatabase};
pub use dirty::{DeadLetter, Priority};
pub use flush::FlushReport;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of deferkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
