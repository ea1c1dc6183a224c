//! WAL Writer
//!
//! Handles appending entries to the log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::{CacheError, Result};
use super::{Operation, WalEntry, WalRecovery};

/// Writes entries to the log file
///
/// Frames go straight to the file (no user-space buffer) so a failed append
/// can be rolled back with `set_len` to the last committed length.
pub struct WalWriter {
    path: PathBuf,
    file: File,

    /// Sequence number the next append will receive
    next_seq: u64,

    sync_strategy: WalSyncStrategy,

    /// Entries written since the last fsync
    uncommitted: usize,

    /// Current file length in bytes
    size_bytes: u64,
}

impl WalWriter {
    /// Open or create a log file
    ///
    /// Runs recovery first so appends land after the last valid entry.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let (_, result) = WalRecovery::recover(path)?;
        Self::open_at(path, sync_strategy, result.last_seq + 1)
    }

    /// Open or create a log file whose next sequence number is already known
    ///
    /// The caller guarantees the file holds no torn tail.
    pub fn open_at(path: &Path, sync_strategy: WalSyncStrategy, next_seq: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let size_bytes = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_seq: next_seq.max(1),
            sync_strategy,
            uncommitted: 0,
            size_bytes,
        })
    }

    /// Append an operation, assigning it the next sequence number
    ///
    /// Returns the assigned sequence number once the entry is written and,
    /// per the sync strategy, fsync'd.
    pub fn append(&mut self, operation: Operation) -> Result<u64> {
        let entry = WalEntry::new(self.next_seq, operation);
        self.append_entry(&entry)
    }

    /// Append a pre-built entry (used when rewriting a log during compaction)
    pub fn append_entry(&mut self, entry: &WalEntry) -> Result<u64> {
        if entry.seq < self.next_seq {
            return Err(CacheError::LogAppend(format!(
                "Sequence {} is behind next sequence {}",
                entry.seq, self.next_seq
            )));
        }

        let frame = entry.serialize()?;
        let committed = self.size_bytes;

        if let Err(e) = self.file.write_all(&frame) {
            self.rollback(committed);
            return Err(CacheError::LogAppend(format!("write failed: {}", e)));
        }
        self.size_bytes += frame.len() as u64;
        self.uncommitted += 1;

        let must_sync = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.uncommitted >= count,
        };
        if must_sync {
            if let Err(e) = self.sync() {
                self.rollback(committed);
                return Err(CacheError::LogAppend(format!("fsync failed: {}", e)));
            }
        }

        self.next_seq = entry.seq + 1;
        Ok(entry.seq)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.uncommitted = 0;
        Ok(())
    }

    /// Sequence number the next append will receive
    pub fn current_seq(&self) -> u64 {
        self.next_seq
    }

    /// Entries written but not yet fsync'd
    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted
    }

    /// Current file length in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop a partially written frame so later appends stay readable
    fn rollback(&mut self, committed: u64) {
        if let Err(e) = self.file.set_len(committed) {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to roll back partial log append"
            );
            return;
        }
        self.size_bytes = committed;
    }
}
