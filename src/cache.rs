//! Write-Back Cache Module
//!
//! The public facade that composes the durable log, cache store, dirty set
//! and flush coordinator.
//!
//! ## Responsibilities
//! - Acknowledge writes after (optional) logging and in-memory update only
//! - Serve reads from memory, reading through to the database on a miss
//! - Synchronous flush, shutdown and crash recovery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::Database;
use crate::dirty::{DeadLetter, DirtySet, Priority};
use crate::error::{CacheError, Result};
use crate::flush::{DeleteOutcome, FlushCoordinator, FlushReport, FlushStats, FlushWorker};
use crate::store::CacheStore;
use crate::wal::DurableLog;

/// Point-in-time view of cache state, for operators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_keys: usize,

    /// Keys not yet confirmed in the database; grows while the database is down
    pub dirty_keys: usize,

    pub in_flight: usize,

    /// Durable log writes not yet marked flushed
    pub log_pending: usize,

    pub flush: FlushStats,
}

/// Outcome of replaying the durable log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Unflushed writes re-applied, in sequence order
    pub replayed: usize,

    /// The flush triggered after replay
    pub flush: FlushReport,
}

/// What `shutdown` could not persist
#[derive(Debug, Clone)]
pub struct ShutdownReport<V> {
    /// The final flush
    pub flush: FlushReport,

    /// Keys still dirty after the final flush (their writes remain in the log)
    pub unflushed: Vec<String>,

    /// The most recent keys escalated during this cache's lifetime, up to
    /// `Config::dead_letter_history`; `CacheStats::flush` counts them all
    pub dead_letters: Vec<DeadLetter<V>>,

    /// Keys escalated during this cache's lifetime, including any no
    /// longer listed in `dead_letters`
    pub dead_letter_total: u64,
}

impl<V> ShutdownReport<V> {
    /// Whether every accepted write reached the database
    pub fn is_complete(&self) -> bool {
        self.unflushed.is_empty() && self.dead_letter_total == 0
    }
}

/// Write-back (write-behind) cache
///
/// ## Concurrency Model
///
/// - **Writes** (`set`/`delete`): serialized by `write_lock` so the log,
///   store and dirty set observe the same per-key order. Only the log
///   append may block (fsync); no database I/O happens on this path.
/// - **Reads** (`get`): concurrent through the store's RwLock; a miss reads
///   through to the database.
/// - **Flushing**: one background thread per cache, plus `force_flush` and
///   `shutdown` on caller threads, all serialized by the coordinator.
pub struct WriteBackCache<V, D> {
    config: Config,
    db: Arc<D>,
    store: CacheStore<V>,
    dirty: Arc<DirtySet<V>>,
    log: Option<Arc<DurableLog>>,
    coordinator: Arc<FlushCoordinator<V>>,
    worker: Mutex<Option<FlushWorker>>,
    dead_letter_rx: Receiver<DeadLetter<V>>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl<V, D> WriteBackCache<V, D>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    D: Database<V>,
{
    /// Open a cache over `db`
    ///
    /// On startup:
    /// 1. Validate config
    /// 2. Open the durable log (if enabled), dropping any torn tail
    /// 3. Replay unflushed writes and flush them
    /// 4. Start the background flush worker
    pub fn open(config: Config, db: Arc<D>) -> Result<Self> {
        config.validate()?;

        let log = if config.durability_enabled {
            let (log, _) = DurableLog::open(&config.log_path, config.wal_sync_strategy)?;
            Some(Arc::new(log))
        } else {
            warn!("Durable log disabled - accepted writes may be lost on crash");
            None
        };

        let dirty = Arc::new(DirtySet::new());
        let (dead_letter_tx, dead_letter_rx) = channel::unbounded();
        let coordinator = Arc::new(FlushCoordinator::new(
            config.clone(),
            Arc::clone(&db),
            Arc::clone(&dirty),
            log.clone(),
            dead_letter_tx,
        )?);

        let cache = Self {
            config,
            db,
            store: CacheStore::new(),
            dirty,
            log,
            coordinator,
            worker: Mutex::new(None),
            dead_letter_rx,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        if cache.log.is_some() {
            let recovery = cache.recover_from_log()?;
            if recovery.replayed > 0 {
                info!(
                    replayed = recovery.replayed,
                    flushed = recovery.flush.flushed,
                    "Recovered unflushed writes from log"
                );
            }
        }

        let worker = FlushWorker::spawn(Arc::clone(&cache.coordinator), cache.config.flush_interval)?;
        *cache.worker.lock() = Some(worker);

        Ok(cache)
    }

    /// Write `value` with the default priority
    pub fn set(&self, key: &str, value: V) -> Result<()> {
        self.set_with_priority(key, value, self.config.default_priority)
    }

    /// Write `value`, flushing it ahead of less urgent keys
    ///
    /// Steps:
    /// 1. Append to the durable log (fails the write if that fails)
    /// 2. Update the store
    /// 3. Mark the key dirty
    pub fn set_with_priority(&self, key: &str, value: V, priority: Priority) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }

        // Step 1: Log first (durability guarantee)
        let log_seq = match &self.log {
            Some(log) => {
                let encoded = bincode::serialize(&value)
                    .map_err(|e| CacheError::LogAppend(format!("encode failed: {}", e)))?;
                let seq = log.append(key, encoded).map_err(|e| match e {
                    CacheError::LogAppend(_) => e,
                    other => CacheError::LogAppend(other.to_string()),
                })?;
                Some(seq)
            }
            None => None,
        };

        // Step 2: Store
        self.store.put(key, value.clone());

        // Step 3: Dirty set
        self.dirty.mark_dirty(key, value, priority, log_seq);

        Ok(())
    }

    /// Read a value
    ///
    /// Search order:
    /// 1. Cache store
    /// 2. Database (read-through; populates the store, not the dirty set)
    ///
    /// A database value is not cached if a delete of the key overlapped
    /// the read.
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        if let Some(value) = self.store.get(key) {
            return Ok(Some(value));
        }

        let epoch = self.store.removal_epoch();
        let settled = self.coordinator.delete_settled(key);
        match self.db.get(key) {
            Ok(value) if settled => Ok(Some(self.store.put_if_absent(key, value, epoch))),
            Ok(value) => Ok(Some(value)),
            Err(CacheError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a key from the cache and the database
    ///
    /// Unlike `set`, this waits for the database. On `Timeout` the key may
    /// still be deleted later: it is already gone from the cache and will
    /// not be flushed again. Any other error leaves the key untouched.
    pub fn delete(&self, key: &str) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }

        let outcome = self.coordinator.delete(key)?;
        self.store.remove(key);
        if let Some(log) = &self.log {
            log.mark_flushed(&[(key.to_string(), log.last_seq())])?;
        }

        match outcome {
            DeleteOutcome::Deleted => Ok(()),
            DeleteOutcome::Unsettled => Err(CacheError::Timeout(self.config.flush_timeout)),
        }
    }

    /// Flush every dirty entry before returning
    ///
    /// Waits for an in-progress background cycle rather than overlapping it.
    /// Returns `FlushIncomplete` if the database rejected part of the work;
    /// those keys stay dirty and are retried in the background.
    pub fn force_flush(&self) -> Result<FlushReport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }

        let report = self.coordinator.flush_all();
        if let Some(log) = &self.log {
            log.sync()?;
        }

        if !report.is_clean() {
            return Err(CacheError::FlushIncomplete {
                remaining: self.dirty.size(),
            });
        }
        Ok(report)
    }

    /// Stop the background worker, flush once more and report leftovers
    ///
    /// Later writes fail with `Closed`. Keys that could not be flushed are
    /// reported, never dropped: they remain in the durable log.
    pub fn shutdown(&self) -> Result<ShutdownReport<V>> {
        {
            let _write_guard = self.write_lock.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(CacheError::Closed);
            }
        }

        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }

        let flush = self.coordinator.flush_all();
        if let Some(log) = &self.log {
            log.sync()?;
        }

        let report = ShutdownReport {
            flush,
            unflushed: self.dirty.keys(),
            dead_letters: self.coordinator.dead_letters(),
            dead_letter_total: self.coordinator.stats().dead_letters,
        };

        if report.is_complete() {
            info!(flushed = flush.flushed, "Write-back cache shut down cleanly");
        } else {
            warn!(
                unflushed = report.unflushed.len(),
                dead_letters = report.dead_letter_total,
                "Write-back cache shut down with unpersisted writes"
            );
            for letter in &report.dead_letters {
                warn!(error = %letter.error(), "Dead-lettered write");
            }
        }

        Ok(report)
    }

    /// Re-apply every unflushed write in the durable log, then flush
    ///
    /// Each record is applied as if freshly `set`, in sequence order.
    /// Called by `open`; calling it again is harmless.
    pub fn recover_from_log(&self) -> Result<RecoveryReport> {
        let Some(log) = &self.log else {
            return Ok(RecoveryReport::default());
        };

        let records = log.replay_unflushed()?;
        let replayed = records.len();
        {
            let _write_guard = self.write_lock.lock();
            for record in records {
                let value: V = bincode::deserialize(&record.value)?;
                self.store.put(&record.key, value.clone());
                self.dirty.mark_dirty(
                    &record.key,
                    value,
                    self.config.default_priority,
                    Some(record.sequence_id),
                );
            }
        }

        let flush = if replayed > 0 {
            self.coordinator.flush_all()
        } else {
            FlushReport::default()
        };

        Ok(RecoveryReport { replayed, flush })
    }

    /// Stream of keys escalated to dead-letter
    pub fn dead_letters(&self) -> Receiver<DeadLetter<V>> {
        self.dead_letter_rx.clone()
    }

    /// Number of keys awaiting flush
    pub fn dirty_count(&self) -> usize {
        self.dirty.size()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_keys: self.store.len(),
            dirty_keys: self.dirty.size(),
            in_flight: self.dirty.in_flight_count(),
            log_pending: self.log.as_ref().map_or(0, |log| log.pending_count()),
            flush: self.coordinator.stats(),
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    pub fn dirty_set(&self) -> &DirtySet<V> {
        &self.dirty
    }

    pub fn durable_log(&self) -> Option<&DurableLog> {
        self.log.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
