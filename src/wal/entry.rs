//! WAL Entry definitions
//!
//! Defines the structure of individual log entries and their framing.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Frame header: seq (8) + crc (4) + len (4)
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size (64 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// A single entry in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Sequence number - monotonically increasing
    pub seq: u64,

    /// The operation recorded
    pub operation: Operation,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// An accepted write; `value` is the encoded cache value
    Write { key: String, value: Vec<u8> },

    /// Every write of `key` with seq <= `up_to` reached the database
    Flushed { key: String, up_to: u64 },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Operation::Write { key, .. } | Operation::Flushed { key, .. } => key,
        }
    }
}

impl WalEntry {
    /// Create an entry stamped with the current time
    pub fn new(seq: u64, operation: Operation) -> Self {
        Self {
            seq,
            operation,
            timestamp: now_millis(),
        }
    }

    /// Encode as a complete frame (header + payload)
    pub fn serialize(&self) -> Result<Bytes> {
        let payload = bincode::serialize(&(&self.operation, self.timestamp))?;
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(CacheError::LogAppend(format!(
                "Entry too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        frame.put_u64_le(self.seq);
        frame.put_u32_le(compute_crc(self.seq, &payload));
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode from a frame header and its payload, verifying the checksum
    pub fn deserialize(header: &[u8; HEADER_SIZE], payload: &[u8]) -> Result<Self> {
        let (seq, crc, len) = parse_header(header);

        if len as usize != payload.len() {
            return Err(CacheError::LogCorruption(format!(
                "Length mismatch at seq {}: header says {}, got {}",
                seq,
                len,
                payload.len()
            )));
        }

        let actual = compute_crc(seq, payload);
        if actual != crc {
            return Err(CacheError::LogCorruption(format!(
                "CRC mismatch at seq {}: expected {:#010x}, got {:#010x}",
                seq, crc, actual
            )));
        }

        let (operation, timestamp): (Operation, u64) = bincode::deserialize(payload)
            .map_err(|e| CacheError::LogCorruption(format!("Bad payload at seq {}: {}", seq, e)))?;

        Ok(Self {
            seq,
            operation,
            timestamp,
        })
    }
}

/// Split a frame header into (seq, crc, payload_len)
pub(crate) fn parse_header(header: &[u8; HEADER_SIZE]) -> (u64, u32, u32) {
    let mut seq = [0u8; 8];
    let mut crc = [0u8; 4];
    let mut len = [0u8; 4];
    seq.copy_from_slice(&header[0..8]);
    crc.copy_from_slice(&header[8..12]);
    len.copy_from_slice(&header[12..16]);
    (
        u64::from_le_bytes(seq),
        u32::from_le_bytes(crc),
        u32::from_le_bytes(len),
    )
}

fn compute_crc(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
