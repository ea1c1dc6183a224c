//! WAL Recovery
//!
//! Scans the log after a crash, dropping a torn or corrupt tail.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::warn;

use crate::error::Result;
use super::{WalEntry, WalReader};

/// Handles log recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted frames encountered (scanning stops at the first)
    pub entries_corrupted: u64,

    /// Last valid sequence number (0 if none)
    pub last_seq: u64,

    /// Whether the log was truncated (partial writes removed)
    pub was_truncated: bool,

    /// Byte length of the valid prefix
    pub valid_bytes: u64,
}

impl WalRecovery {
    /// Recover entries from a log file
    ///
    /// This will:
    /// 1. Read all valid entries
    /// 2. Stop at the first torn or corrupt frame
    /// 3. Truncate the file to the valid prefix
    /// 4. Return all valid entries in order
    ///
    /// A missing file recovers to nothing.
    pub fn recover(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let (entries, mut result, file_len) = Self::scan(path)?;

        if result.entries_corrupted > 0 && file_len > result.valid_bytes {
            warn!(
                path = %path.display(),
                valid_bytes = result.valid_bytes,
                file_len,
                "Truncating corrupt log tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(result.valid_bytes)?;
            file.sync_all()?;
            result.was_truncated = true;
        }

        Ok((entries, result))
    }

    /// Verify integrity of a log file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let (_, result, _) = Self::scan(path)?;
        Ok(result)
    }

    fn scan(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult, u64)> {
        if !path.exists() {
            return Ok((Vec::new(), RecoveryResult::default(), 0));
        }

        let file_len = std::fs::metadata(path)?.len();
        let mut reader = WalReader::open(path)?;
        let mut entries: Vec<WalEntry> = Vec::new();
        let mut result = RecoveryResult::default();

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    // Sequence numbers must strictly increase; anything else is garbage
                    if entry.seq <= result.last_seq && !entries.is_empty() {
                        warn!(
                            seq = entry.seq,
                            last_seq = result.last_seq,
                            "Out-of-order sequence number in log"
                        );
                        result.entries_corrupted += 1;
                        result.valid_bytes = position_before(&reader, &entry)?;
                        break;
                    }
                    result.last_seq = entry.seq;
                    result.entries_recovered += 1;
                    result.valid_bytes = reader.position();
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, offset = reader.position(), "Stopping log scan");
                    result.entries_corrupted += 1;
                    result.valid_bytes = reader.position();
                    break;
                }
            }
        }

        Ok((entries, result, file_len))
    }
}

/// Offset at which `entry` began, given the reader has just consumed it
fn position_before(reader: &WalReader, entry: &WalEntry) -> Result<u64> {
    let frame_len = entry.serialize()?.len() as u64;
    Ok(reader.position().saturating_sub(frame_len))
}
