//! WAL Reader
//!
//! Handles reading entries from the log file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{CacheError, Result};
use super::entry::{parse_header, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use super::WalEntry;

/// Reads entries from the log file
pub struct WalReader {
    reader: BufReader<File>,

    /// Byte offset just past the last entry successfully read
    position: u64,
}

impl WalReader {
    /// Open a log file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
        })
    }

    /// Read the next entry from the log
    ///
    /// Returns:
    /// - `Ok(Some(entry))`: a valid entry
    /// - `Ok(None)`: clean end of file
    /// - `Err(LogCorruption)`: torn frame or checksum failure
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => {
                return Err(CacheError::LogCorruption(format!(
                    "Torn header at offset {}: {} of {} bytes",
                    self.position, n, HEADER_SIZE
                )));
            }
            _ => {}
        }

        let (seq, _, len) = parse_header(&header);
        if len > MAX_PAYLOAD_SIZE {
            return Err(CacheError::LogCorruption(format!(
                "Implausible payload length {} at seq {}",
                len, seq
            )));
        }

        let mut payload = vec![0u8; len as usize];
        let read = read_full(&mut self.reader, &mut payload)?;
        if read < payload.len() {
            return Err(CacheError::LogCorruption(format!(
                "Torn payload at seq {}: {} of {} bytes",
                seq, read, len
            )));
        }

        let entry = WalEntry::deserialize(&header, &payload)?;
        self.position += (HEADER_SIZE + payload.len()) as u64;
        Ok(Some(entry))
    }

    /// Byte offset just past the last valid entry
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Iterate over all valid entries
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over log entries; stops after the first error
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Like `read_exact`, but reports how many bytes were available at EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
