//! Tests for the Flush Coordinator
//!
//! These tests verify:
//! - One `batch_set` per priority group, most urgent first
//! - Success clears the dirty set and marks the log
//! - Failure requeues, then escalates to dead-letter
//! - Database calls that exceed the timeout count as failures
//! - Delete is ordered after earlier flushes
//! - Calls abandoned in the queue never reach the database
//! - Compaction and dead-letter history stay bounded during an outage

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use tempfile::TempDir;

use deferkv::config::{Config, WalSyncStrategy};
use deferkv::dirty::{DirtySet, Priority};
use deferkv::flush::{DeleteOutcome, FlushCoordinator, FlushWorker};
use deferkv::wal::DurableLog;
use deferkv::{Batch, CacheError, Database, DeadLetter, MemoryDatabase, Result};

// =============================================================================
// Test Databases
// =============================================================================

/// Records every batch it receives; fails while `failing` is set
#[derive(Default)]
struct RecordingDatabase {
    inner: MemoryDatabase<String>,
    batches: Mutex<Vec<Batch<String>>>,
    failing: AtomicBool,
}

impl RecordingDatabase {
    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(|b| b.len()).collect()
    }
}

impl Database<String> for RecordingDatabase {
    fn get(&self, key: &str) -> Result<String> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.inner.set(key, value)
    }

    fn batch_set(&self, batch: Batch<String>) -> Result<()> {
        self.batches.lock().push(batch.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Database("connection refused".to_string()));
        }
        self.inner.batch_set(batch)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
}

/// Sleeps before every batch_set and delete, counting the calls it runs
struct SlowDatabase {
    inner: MemoryDatabase<String>,
    delay: Duration,
    batch_calls: AtomicUsize,
}

impl SlowDatabase {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryDatabase::new(),
            delay,
            batch_calls: AtomicUsize::new(0),
        }
    }
}

impl Database<String> for SlowDatabase {
    fn get(&self, key: &str) -> Result<String> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.inner.set(key, value)
    }

    fn batch_set(&self, batch: Batch<String>) -> Result<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.inner.batch_set(batch)
    }

    fn delete(&self, key: &str) -> Result<()> {
        thread::sleep(self.delay);
        self.inner.delete(key)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

struct Harness<D: Database<String>> {
    db: Arc<D>,
    dirty: Arc<DirtySet<String>>,
    coordinator: Arc<FlushCoordinator<String>>,
    dead_letters: Receiver<DeadLetter<String>>,
}

fn test_config() -> Config {
    Config::builder()
        .flush_batch_size(100)
        .max_retries(2)
        .flush_timeout(Duration::from_secs(2))
        .retry_backoff(Duration::ZERO, Duration::ZERO)
        .build()
}

fn setup<D: Database<String>>(config: Config, db: D, log: Option<Arc<DurableLog>>) -> Harness<D> {
    let db = Arc::new(db);
    let dirty = Arc::new(DirtySet::new());
    let (tx, rx) = channel::unbounded();
    let coordinator = Arc::new(
        FlushCoordinator::new(config, Arc::clone(&db), Arc::clone(&dirty), log, tx).unwrap(),
    );
    Harness {
        db,
        dirty,
        coordinator,
        dead_letters: rx,
    }
}

fn setup_temp_log() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("flush.wal");
    (temp_dir, log_path)
}

fn mark(h: &Harness<impl Database<String>>, key: &str, value: &str, priority: Priority) {
    h.dirty.mark_dirty(key, value.to_string(), priority, None);
}

// =============================================================================
// Batching / Ordering Tests
// =============================================================================

#[test]
fn test_empty_cycle_makes_no_calls() {
    let h = setup(test_config(), RecordingDatabase::default(), None);

    let report = h.coordinator.run_cycle();

    assert_eq!(report.batches, 0);
    assert!(h.db.batches.lock().is_empty());
    assert_eq!(h.coordinator.stats().cycles, 0);
}

#[test]
fn test_priority_groups_flush_in_order() {
    let h = setup(test_config(), RecordingDatabase::default(), None);

    mark(&h, "low", "x", Priority(3));
    mark(&h, "a", "x", Priority(1));
    mark(&h, "mid", "x", Priority(2));
    mark(&h, "b", "x", Priority(1));

    let report = h.coordinator.run_cycle();

    assert_eq!(report.batches, 3);
    assert_eq!(report.flushed, 4);

    let batches = h.db.batches.lock();
    let keys: Vec<Vec<&str>> = batches
        .iter()
        .map(|b| b.keys().map(String::as_str).collect())
        .collect();
    assert_eq!(keys, vec![vec!["a", "b"], vec!["mid"], vec!["low"]]);
}

#[test]
fn test_cycle_respects_batch_size() {
    let config = Config::builder().flush_batch_size(5).build();
    let h = setup(config, RecordingDatabase::default(), None);

    for i in 0..12 {
        mark(&h, &format!("k{:02}", i), "v", Priority::MEDIUM);
    }

    h.coordinator.run_cycle();
    assert_eq!(h.dirty.size(), 7);

    let report = h.coordinator.flush_all();
    assert_eq!(report.flushed, 7);
    assert!(h.dirty.is_empty());
    assert_eq!(h.db.batch_sizes(), vec![5, 5, 2]);
}

#[test]
fn test_coalesced_key_written_once() {
    let h = setup(test_config(), RecordingDatabase::default(), None);

    mark(&h, "user:123", "v1", Priority::MEDIUM);
    mark(&h, "user:123", "v2", Priority::MEDIUM);
    h.coordinator.flush_all();

    let batches = h.db.batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].get("user:123"), Some(&"v2".to_string()));
}

// =============================================================================
// Durable Log Integration Tests
// =============================================================================

#[test]
fn test_success_marks_log_flushed() {
    let (_temp, log_path) = setup_temp_log();
    let (log, _) = DurableLog::open(&log_path, WalSyncStrategy::EveryWrite).unwrap();
    let log = Arc::new(log);
    let h = setup(test_config(), RecordingDatabase::default(), Some(Arc::clone(&log)));

    let seq = log.append("k", b"v".to_vec()).unwrap();
    h.dirty.mark_dirty("k", "v".to_string(), Priority::MEDIUM, Some(seq));
    assert_eq!(log.pending_count(), 1);

    h.coordinator.flush_all();

    assert_eq!(log.pending_count(), 0);
    assert!(log.replay_unflushed().unwrap().is_empty());
}

#[test]
fn test_failure_leaves_log_pending() {
    let (_temp, log_path) = setup_temp_log();
    let (log, _) = DurableLog::open(&log_path, WalSyncStrategy::EveryWrite).unwrap();
    let log = Arc::new(log);
    let h = setup(test_config(), RecordingDatabase::default(), Some(Arc::clone(&log)));
    h.db.failing.store(true, Ordering::SeqCst);

    let seq = log.append("k", b"v".to_vec()).unwrap();
    h.dirty.mark_dirty("k", "v".to_string(), Priority::MEDIUM, Some(seq));
    h.coordinator.run_cycle();

    assert_eq!(log.pending_count(), 1);
}

// =============================================================================
// Retry / Escalation Tests
// =============================================================================

#[test]
fn test_failed_batch_is_requeued() {
    let h = setup(test_config(), RecordingDatabase::default(), None);
    h.db.failing.store(true, Ordering::SeqCst);
    mark(&h, "k", "v", Priority::MEDIUM);

    let report = h.coordinator.run_cycle();

    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.requeued, 1);
    assert!(!report.is_clean());
    assert_eq!(h.dirty.get("k").unwrap().retry_count, 1);

    // Database recovers
    h.db.failing.store(false, Ordering::SeqCst);
    let report = h.coordinator.run_cycle();
    assert_eq!(report.flushed, 1);
    assert!(h.dirty.is_empty());
    assert_eq!(h.db.inner.get("k").unwrap(), "v");
}

#[test]
fn test_escalation_after_max_retries() {
    let h = setup(test_config(), RecordingDatabase::default(), None);
    h.db.failing.store(true, Ordering::SeqCst);
    mark(&h, "k", "v", Priority::MEDIUM);

    // max_retries = 2: attempts 1 and 2 requeue, attempt 3 escalates
    let mut escalated = 0;
    for _ in 0..3 {
        escalated += h.coordinator.run_cycle().escalated;
    }

    assert_eq!(escalated, 1);
    assert!(h.dirty.is_empty());
    assert_eq!(h.db.batches.lock().len(), 3);

    let letter = h.dead_letters.try_recv().unwrap();
    assert_eq!(letter.key, "k");
    assert_eq!(letter.attempts, 3);
    assert!(matches!(letter.error(), CacheError::RetriesExhausted { attempts: 3, .. }));

    assert_eq!(h.coordinator.dead_letters().len(), 1);
    assert_eq!(h.coordinator.stats().dead_letters, 1);

    // Nothing more to attempt
    assert_eq!(h.coordinator.run_cycle().batches, 0);
}

#[test]
fn test_backoff_defers_retry() {
    let config = Config::builder()
        .retry_backoff(Duration::from_secs(60), Duration::from_secs(60))
        .build();
    let h = setup(config, RecordingDatabase::default(), None);
    h.db.failing.store(true, Ordering::SeqCst);
    mark(&h, "k", "v", Priority::MEDIUM);

    h.coordinator.run_cycle();
    h.db.failing.store(false, Ordering::SeqCst);

    // Still backing off
    assert_eq!(h.coordinator.run_cycle().batches, 0);

    // flush_all ignores backoff
    let report = h.coordinator.flush_all();
    assert_eq!(report.flushed, 1);
}

#[test]
fn test_flush_all_stops_on_failure() {
    let h = setup(test_config(), RecordingDatabase::default(), None);
    h.db.failing.store(true, Ordering::SeqCst);
    mark(&h, "k", "v", Priority::MEDIUM);

    let report = h.coordinator.flush_all();

    assert_eq!(report.batches, 1);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(h.dirty.size(), 1);
}

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_slow_database_times_out() {
    let config = Config::builder()
        .flush_timeout(Duration::from_millis(50))
        .retry_backoff(Duration::ZERO, Duration::ZERO)
        .build();
    let h = setup(config, SlowDatabase::new(Duration::from_millis(300)), None);
    mark(&h, "k", "v", Priority::MEDIUM);

    let start = Instant::now();
    let report = h.coordinator.run_cycle();

    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(report.failed_batches, 1);
    assert_eq!(h.dirty.get("k").unwrap().retry_count, 1);
}

fn quick_timeout_config() -> Config {
    Config::builder()
        .flush_timeout(Duration::from_millis(50))
        .max_retries(100)
        .retry_backoff(Duration::ZERO, Duration::ZERO)
        .build()
}

#[test]
fn test_calls_abandoned_in_queue_are_skipped() {
    let h = setup(quick_timeout_config(), SlowDatabase::new(Duration::from_millis(300)), None);
    mark(&h, "k", "v", Priority::MEDIUM);

    // First call occupies the database; the retries queue behind it and time out
    for _ in 0..3 {
        assert_eq!(h.coordinator.run_cycle().failed_batches, 1);
    }
    thread::sleep(Duration::from_millis(500));

    assert_eq!(h.db.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.db.inner.get("k").unwrap(), "v");
    assert_eq!(h.dirty.get("k").unwrap().retry_count, 3);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_removes_dirty_record() {
    let h = setup(test_config(), RecordingDatabase::default(), None);
    h.db.inner.set("k", "old".to_string()).unwrap();
    mark(&h, "k", "new", Priority::MEDIUM);

    assert_eq!(h.coordinator.delete("k").unwrap(), DeleteOutcome::Deleted);

    assert!(h.dirty.is_empty());
    assert!(h.coordinator.delete_settled("k"));
    assert!(matches!(h.db.inner.get("k"), Err(CacheError::NotFound)));
    assert_eq!(h.coordinator.flush_all().batches, 0);
}

#[test]
fn test_delete_running_past_timeout_is_unsettled() {
    let h = setup(quick_timeout_config(), SlowDatabase::new(Duration::from_millis(300)), None);
    h.db.inner.set("k", "old".to_string()).unwrap();
    mark(&h, "k", "new", Priority::MEDIUM);

    let outcome = h.coordinator.delete("k").unwrap();

    assert_eq!(outcome, DeleteOutcome::Unsettled);
    assert!(h.dirty.is_empty());
    assert!(!h.coordinator.delete_settled("k"));

    thread::sleep(Duration::from_millis(500));
    assert!(h.coordinator.delete_settled("k"));
    assert!(matches!(h.db.inner.get("k"), Err(CacheError::NotFound)));
}

#[test]
fn test_delete_queued_past_timeout_changes_nothing() {
    let h = setup(quick_timeout_config(), SlowDatabase::new(Duration::from_millis(300)), None);
    mark(&h, "k", "v", Priority::MEDIUM);

    // Leaves a batch running in the database
    assert_eq!(h.coordinator.run_cycle().failed_batches, 1);

    let result = h.coordinator.delete("k");

    assert!(matches!(result, Err(CacheError::Timeout(_))));
    assert!(h.coordinator.delete_settled("k"));
    assert_eq!(h.dirty.size(), 1);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(h.db.inner.get("k").unwrap(), "v");
}

// =============================================================================
// Outage Tests
// =============================================================================

#[test]
fn test_compaction_not_repeated_while_database_down() {
    let (_temp, log_path) = setup_temp_log();
    let (log, _) = DurableLog::open(&log_path, WalSyncStrategy::EveryWrite).unwrap();
    let log = Arc::new(log);
    let config = Config::builder()
        .max_retries(100)
        .retry_backoff(Duration::ZERO, Duration::ZERO)
        .log_compact_threshold(1)
        .build();
    let h = setup(config, RecordingDatabase::default(), Some(Arc::clone(&log)));
    h.db.failing.store(true, Ordering::SeqCst);

    for i in 0..10 {
        let key = format!("k{}", i);
        let seq = log.append(&key, b"v".to_vec()).unwrap();
        h.dirty.mark_dirty(&key, "v".to_string(), Priority::MEDIUM, Some(seq));
    }

    for _ in 0..5 {
        assert_eq!(h.coordinator.run_cycle().failed_batches, 1);
    }

    // Nothing could be dropped after the first, so it is not retried
    assert_eq!(h.coordinator.stats().compactions, 1);
    assert_eq!(log.pending_count(), 10);
}

#[test]
fn test_dead_letter_history_is_capped() {
    let config = Config::builder()
        .max_retries(0)
        .retry_backoff(Duration::ZERO, Duration::ZERO)
        .dead_letter_history(2)
        .build();
    let h = setup(config, RecordingDatabase::default(), None);
    h.db.failing.store(true, Ordering::SeqCst);
    for key in ["a", "b", "c"] {
        mark(&h, key, "v", Priority::MEDIUM);
    }

    let report = h.coordinator.run_cycle();

    assert_eq!(report.escalated, 3);
    assert_eq!(h.coordinator.dead_letters().len(), 2);
    assert_eq!(h.coordinator.stats().dead_letters, 3);
    assert_eq!(h.dead_letters.try_iter().count(), 3);
}

// =============================================================================
// Worker Tests
// =============================================================================

#[test]
fn test_worker_flushes_on_interval() {
    let h = setup(test_config(), RecordingDatabase::default(), None);
    mark(&h, "k", "v", Priority::MEDIUM);

    let mut worker = FlushWorker::spawn(Arc::clone(&h.coordinator), Duration::from_millis(20)).unwrap();
    assert!(worker.is_running());

    let deadline = Instant::now() + Duration::from_secs(2);
    while !h.dirty.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    worker.stop();

    assert!(h.dirty.is_empty());
    assert!(!worker.is_running());
    assert_eq!(h.db.inner.get("k").unwrap(), "v");
}
