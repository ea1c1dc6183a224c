//! Durable Log
//!
//! Crash-recoverable record of accepted-but-not-yet-flushed writes, built on
//! the framed WAL. Records are never rewritten: "flushed" is expressed by a
//! later `Flushed` marker entry.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::WalSyncStrategy;
use crate::error::Result;
use super::{Operation, RecoveryResult, WalReader, WalRecovery, WalWriter};

/// A logged write as seen by recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub sequence_id: u64,
    pub key: String,
    /// Encoded cache value
    pub value: Vec<u8>,
    /// Unix millis
    pub written_at: u64,
    pub flushed: bool,
}

/// Outcome of a compaction pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    pub records_kept: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

struct LogState {
    writer: WalWriter,

    /// Unflushed write sequence numbers, per key
    pending: HashMap<String, BTreeSet<u64>>,

    pending_count: usize,
}

/// Append-only durable log with flush markers
pub struct DurableLog {
    path: PathBuf,
    sync_strategy: WalSyncStrategy,
    state: Mutex<LogState>,
}

impl DurableLog {
    /// Open or create the log, recovering its valid prefix
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<(Self, RecoveryResult)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (entries, recovery) = WalRecovery::recover(path)?;

        let mut pending: HashMap<String, BTreeSet<u64>> = HashMap::new();
        for entry in &entries {
            match &entry.operation {
                Operation::Write { key, .. } => {
                    pending.entry(key.clone()).or_default().insert(entry.seq);
                }
                Operation::Flushed { key, up_to } => {
                    if let Some(seqs) = pending.get_mut(key) {
                        seqs.retain(|seq| seq > up_to);
                        if seqs.is_empty() {
                            pending.remove(key);
                        }
                    }
                }
            }
        }
        let pending_count = pending.values().map(BTreeSet::len).sum();

        let writer = WalWriter::open_at(path, sync_strategy, recovery.last_seq + 1)?;

        info!(
            path = %path.display(),
            recovered = recovery.entries_recovered,
            corrupted = recovery.entries_corrupted,
            unflushed = pending_count,
            last_seq = recovery.last_seq,
            "Opened durable log"
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                sync_strategy,
                state: Mutex::new(LogState {
                    writer,
                    pending,
                    pending_count,
                }),
            },
            recovery,
        ))
    }

    /// Durably record a write, returning its sequence number
    pub fn append(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut state = self.state.lock();
        let seq = state.writer.append(Operation::Write {
            key: key.to_string(),
            value,
        })?;
        state.pending.entry(key.to_string()).or_default().insert(seq);
        state.pending_count += 1;
        Ok(seq)
    }

    /// Mark every write of each key up to the given sequence as flushed
    ///
    /// Idempotent: keys with nothing left to mark produce no marker entry.
    pub fn mark_flushed(&self, flushed: &[(String, u64)]) -> Result<()> {
        let mut state = self.state.lock();
        for (key, up_to) in flushed {
            let removed = match state.pending.get_mut(key) {
                Some(seqs) => {
                    let before = seqs.len();
                    seqs.retain(|seq| seq > up_to);
                    let removed = before - seqs.len();
                    if seqs.is_empty() {
                        state.pending.remove(key);
                    }
                    removed
                }
                None => 0,
            };
            if removed == 0 {
                continue;
            }
            state.pending_count -= removed;
            state.writer.append(Operation::Flushed {
                key: key.clone(),
                up_to: *up_to,
            })?;
        }
        Ok(())
    }

    /// Every unflushed write, in sequence order
    pub fn replay_unflushed(&self) -> Result<Vec<LogRecord>> {
        let state = self.state.lock();
        let unflushed: BTreeSet<u64> = state.pending.values().flatten().copied().collect();
        if unflushed.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(unflushed.len());
        for entry in WalReader::open(&self.path)?.entries() {
            let entry = entry?;
            if !unflushed.contains(&entry.seq) {
                continue;
            }
            if let Operation::Write { key, value } = entry.operation {
                records.push(LogRecord {
                    sequence_id: entry.seq,
                    key,
                    value,
                    written_at: entry.timestamp,
                    flushed: false,
                });
            }
        }
        Ok(records)
    }

    /// Every write record in a log file with its flushed flag, without
    /// modifying the file
    pub fn scan(path: &Path) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mut flushed_up_to: HashMap<String, u64> = HashMap::new();

        for entry in WalReader::open(path)?.entries() {
            let entry = match entry {
                Ok(entry) => entry,
                // Torn tail: report what is readable
                Err(_) => break,
            };
            match entry.operation {
                Operation::Write { key, value } => records.push(LogRecord {
                    sequence_id: entry.seq,
                    key,
                    value,
                    written_at: entry.timestamp,
                    flushed: false,
                }),
                Operation::Flushed { key, up_to } => {
                    let mark = flushed_up_to.entry(key).or_insert(0);
                    *mark = (*mark).max(up_to);
                }
            }
        }

        for record in &mut records {
            if let Some(up_to) = flushed_up_to.get(&record.key) {
                record.flushed = record.sequence_id <= *up_to;
            }
        }
        Ok(records)
    }

    /// Rewrite the log keeping only unflushed writes
    ///
    /// The replacement is written to a sibling file, fsync'd, then renamed
    /// over the original. Sequence numbers are preserved.
    pub fn compact(&self) -> Result<CompactionResult> {
        let mut state = self.state.lock();
        let bytes_before = state.writer.size_bytes();
        let next_seq = state.writer.current_seq();

        let unflushed: BTreeSet<u64> = state.pending.values().flatten().copied().collect();
        let tmp_path = self.path.with_extension("compact");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let mut records_kept = 0;
        {
            let mut tmp = WalWriter::open_at(
                &tmp_path,
                WalSyncStrategy::EveryNEntries { count: usize::MAX },
                1,
            )?;
            for entry in WalReader::open(&self.path)?.entries() {
                let entry = entry?;
                if unflushed.contains(&entry.seq) {
                    tmp.append_entry(&entry)?;
                    records_kept += 1;
                }
            }
            tmp.sync()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        state.writer = WalWriter::open_at(&self.path, self.sync_strategy, next_seq)?;
        let bytes_after = state.writer.size_bytes();

        debug!(records_kept, bytes_before, bytes_after, "Compacted durable log");

        Ok(CompactionResult {
            records_kept,
            bytes_before,
            bytes_after,
        })
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        self.state.lock().writer.sync()
    }

    /// Number of writes not yet marked flushed
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending_count
    }

    /// Highest sequence number assigned so far (0 if none)
    pub fn last_seq(&self) -> u64 {
        self.state.lock().writer.current_seq() - 1
    }

    /// Current file length in bytes
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().writer.size_bytes()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
