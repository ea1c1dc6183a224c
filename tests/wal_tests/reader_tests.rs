//! Tests for WAL Reader
//!
//! These tests verify:
//! - Reading back written entries in order
//! - Clean EOF vs. torn frames
//! - Position tracking

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use deferkv::config::WalSyncStrategy;
use deferkv::wal::{Operation, WalEntry, WalReader, WalWriter, HEADER_SIZE};
use deferkv::CacheError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("test.wal");
    (temp_dir, wal_path)
}

fn write_entries(path: &PathBuf, count: usize) {
    let mut writer = WalWriter::open(path, WalSyncStrategy::EveryWrite).unwrap();
    for i in 0..count {
        writer
            .append(Operation::Write {
                key: format!("key{}", i),
                value: format!("value{}", i).into_bytes(),
            })
            .unwrap();
    }
}

// =============================================================================
// Reading Tests
// =============================================================================

#[test]
fn test_read_empty_file() {
    let (_temp, wal_path) = setup_temp_wal();
    File::create(&wal_path).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();

    assert!(reader.next_entry().unwrap().is_none());
    assert_eq!(reader.position(), 0);
}

#[test]
fn test_read_entries_in_order() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 10);

    let mut reader = WalReader::open(&wal_path).unwrap();
    let mut seqs = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        assert_eq!(entry.operation.key(), format!("key{}", seqs.len()));
        seqs.push(entry.seq);
    }

    assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    assert_eq!(reader.position(), std::fs::metadata(&wal_path).unwrap().len());
}

#[test]
fn test_open_missing_file_fails() {
    let (_temp, wal_path) = setup_temp_wal();

    assert!(matches!(WalReader::open(&wal_path), Err(CacheError::Io(_))));
}

// =============================================================================
// Torn Frame Tests
// =============================================================================

#[test]
fn test_torn_header_is_corruption() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 2);
    let valid_len = std::fs::metadata(&wal_path).unwrap().len();

    let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&[0xAB; HEADER_SIZE / 2]).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(reader.next_entry().unwrap().is_some());
    assert!(reader.next_entry().unwrap().is_some());
    assert!(matches!(reader.next_entry(), Err(CacheError::LogCorruption(_))));
    assert_eq!(reader.position(), valid_len);
}

#[test]
fn test_torn_payload_is_corruption() {
    let (_temp, wal_path) = setup_temp_wal();

    let entry = WalEntry::new(
        1,
        Operation::Write {
            key: "k".to_string(),
            value: vec![7; 64],
        },
    );
    let frame = entry.serialize().unwrap();
    let mut file = File::create(&wal_path).unwrap();
    file.write_all(&frame[..frame.len() - 10]).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_entry(), Err(CacheError::LogCorruption(_))));
}

#[test]
fn test_iterator_stops_after_error() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 3);

    let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&[0xFF; 5]).unwrap();

    let results: Vec<_> = WalReader::open(&wal_path).unwrap().entries().collect();

    assert_eq!(results.len(), 4);
    assert!(results[..3].iter().all(|r| r.is_ok()));
    assert!(results[3].is_err());
}
