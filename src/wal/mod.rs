//! Durable Log Module
//!
//! Write-ahead log of accepted-but-not-yet-flushed writes.
//!
//! ## Responsibilities
//! - Append every accepted write before it is acknowledged
//! - CRC32 checksums for corruption detection
//! - Monotonic sequence numbers for global write order
//! - Flush markers instead of in-place mutation
//! - Replay of unflushed writes on startup, compaction of flushed ones
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ Seq (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ Seq (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//!
//! `Data` is the bincode encoding of the operation and its timestamp.
//! The CRC covers the sequence number and the data.

mod entry;
mod writer;
mod reader;
mod recovery;
mod durable;

pub use entry::{WalEntry, Operation, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use writer::WalWriter;
pub use reader::{WalReader, WalIterator};
pub use recovery::{WalRecovery, RecoveryResult};
pub use durable::{DurableLog, LogRecord, CompactionResult};
