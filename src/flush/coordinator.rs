//! Flush Coordinator
//!
//! Selects batches from the dirty set, persists them, and commits the
//! outcome: clear on success, requeue with backoff on failure, dead-letter
//! once a key runs out of retries.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::{Batch, Database};
use crate::dirty::{DeadLetter, DirtySet, FlushItem, RetryOutcome};
use crate::error::{CacheError, Result};
use crate::wal::DurableLog;
use super::FlushReport;

/// Cumulative counters across all cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub cycles: u64,
    pub keys_flushed: u64,
    pub failed_batches: u64,
    pub dead_letters: u64,
    pub compactions: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    keys_flushed: AtomicU64,
    failed_batches: AtomicU64,
    dead_letters: AtomicU64,
    compactions: AtomicU64,
}

// Call states; the database thread and the waiting caller race to move a
// call out of QUEUED, and exactly one of them wins.
const CALL_QUEUED: u8 = 0;
const CALL_STARTED: u8 = 1;
const CALL_ABANDONED: u8 = 2;

enum DbOp<V> {
    BatchSet(Batch<V>),
    Delete(String),
}

struct DbCall<V> {
    op: DbOp<V>,
    state: Arc<AtomicU8>,
    reply: Sender<Result<()>>,
}

/// How a database call ended from the caller's point of view
enum CallOutcome {
    Done(Result<()>),

    /// Timed out while still queued; it will never run
    Abandoned,

    /// Timed out while running; the receiver yields its eventual result
    Running(Receiver<Result<()>>),
}

impl CallOutcome {
    fn into_result(self, timeout: Duration) -> Result<()> {
        match self {
            CallOutcome::Done(result) => result,
            CallOutcome::Abandoned | CallOutcome::Running(_) => Err(CacheError::Timeout(timeout)),
        }
    }
}

/// Runs database mutations one at a time, in submission order
struct DbCaller<V> {
    calls: Sender<DbCall<V>>,
}

impl<V: Send + 'static> DbCaller<V> {
    fn spawn<D: Database<V>>(db: Arc<D>) -> Result<Self> {
        let (calls, rx) = channel::unbounded::<DbCall<V>>();
        thread::Builder::new()
            .name("deferkv-db".to_string())
            .spawn(move || {
                while let Ok(call) = rx.recv() {
                    let claimed = call
                        .state
                        .compare_exchange(CALL_QUEUED, CALL_STARTED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    if !claimed {
                        // Caller gave up before we got here
                        continue;
                    }

                    let result = panic::catch_unwind(AssertUnwindSafe(|| match call.op {
                        DbOp::BatchSet(batch) => db.batch_set(batch),
                        DbOp::Delete(key) => db.delete(&key),
                    }))
                    .unwrap_or_else(|_| Err(CacheError::Database("database call panicked".to_string())));
                    let _ = call.reply.send(result);
                }
            })?;
        Ok(Self { calls })
    }

    /// Submit an operation and wait at most `timeout` for its outcome
    fn call(&self, op: DbOp<V>, timeout: Duration) -> CallOutcome {
        let state = Arc::new(AtomicU8::new(CALL_QUEUED));
        let (reply, outcome) = channel::bounded(1);
        let submitted = self.calls.send(DbCall {
            op,
            state: Arc::clone(&state),
            reply,
        });
        if submitted.is_err() {
            return CallOutcome::Done(Err(CacheError::Database("database worker stopped".to_string())));
        }

        match outcome.recv_timeout(timeout) {
            Ok(result) => CallOutcome::Done(result),
            Err(RecvTimeoutError::Timeout) => {
                let abandoned = state
                    .compare_exchange(CALL_QUEUED, CALL_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if abandoned {
                    return CallOutcome::Abandoned;
                }
                match outcome.try_recv() {
                    Ok(result) => CallOutcome::Done(result),
                    Err(_) => CallOutcome::Running(outcome),
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                CallOutcome::Done(Err(CacheError::Database("database worker stopped".to_string())))
            }
        }
    }
}

/// Outcome of `FlushCoordinator::delete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The database confirmed the delete
    Deleted,

    /// The delete was still running when the timeout expired; it may land
    /// later. The dirty record is already dropped.
    Unsettled,
}

/// Drives persistence of dirty entries
///
/// ## Concurrency
/// - `cycle_lock` admits exactly one flush cycle at a time; `flush_all`
///   holds it across its cycles so it waits for (never overlaps) a
///   timer-driven cycle.
/// - The dirty set's lock is held only to drain and to commit outcomes,
///   never across a database call.
pub struct FlushCoordinator<V> {
    config: Config,
    dirty: Arc<DirtySet<V>>,
    log: Option<Arc<DurableLog>>,
    caller: DbCaller<V>,
    cycle_lock: Mutex<()>,
    counters: Counters,

    /// Log size above which the next compaction runs
    compact_at: AtomicU64,

    /// Deletes that outlived their timeout, by key
    unsettled_deletes: Mutex<HashMap<String, Receiver<Result<()>>>>,

    dead_letter_tx: Sender<DeadLetter<V>>,
    dead_letters: Mutex<VecDeque<DeadLetter<V>>>,
}

impl<V> FlushCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new<D: Database<V>>(
        config: Config,
        db: Arc<D>,
        dirty: Arc<DirtySet<V>>,
        log: Option<Arc<DurableLog>>,
        dead_letter_tx: Sender<DeadLetter<V>>,
    ) -> Result<Self> {
        let caller = DbCaller::spawn(db)?;
        let compact_at = AtomicU64::new(config.log_compact_threshold);
        Ok(Self {
            config,
            dirty,
            log,
            caller,
            cycle_lock: Mutex::new(()),
            counters: Counters::default(),
            compact_at,
            unsettled_deletes: Mutex::new(HashMap::new()),
            dead_letter_tx,
            dead_letters: Mutex::new(VecDeque::new()),
        })
    }

    /// Run one timer-driven cycle (keys still backing off are skipped)
    pub fn run_cycle(&self) -> FlushReport {
        let _cycle = self.cycle_lock.lock();
        self.cycle(false)
    }

    /// Flush every dirty entry, ignoring backoff
    ///
    /// Repeats cycles until the dirty set is empty. Stops early when a
    /// cycle has a failure, since an immediate retry would only burn the
    /// failing keys' retry budget; the report then shows `failed_batches > 0`.
    pub fn flush_all(&self) -> FlushReport {
        let _cycle = self.cycle_lock.lock();
        let mut report = FlushReport::default();

        while !self.dirty.is_empty() {
            let cycle = self.cycle(true);
            report.merge(cycle);
            if cycle.batches == 0 || !cycle.is_clean() {
                break;
            }
        }
        report
    }

    /// Delete `key` from the database and drop its dirty record
    ///
    /// Waits for any running cycle, and is queued behind every earlier
    /// database call, so an older flush of the key cannot land after it.
    /// An error means the delete never reached the database and nothing
    /// was changed.
    pub fn delete(&self, key: &str) -> Result<DeleteOutcome> {
        let _cycle = self.cycle_lock.lock();
        let timeout = self.config.flush_timeout;

        match self.caller.call(DbOp::Delete(key.to_string()), timeout) {
            CallOutcome::Done(result) => {
                result?;
                // FIFO: any earlier delete of this key has landed too
                self.unsettled_deletes.lock().remove(key);
                self.dirty.remove(key);
                Ok(DeleteOutcome::Deleted)
            }
            CallOutcome::Abandoned => Err(CacheError::Timeout(timeout)),
            CallOutcome::Running(pending) => {
                warn!(%key, timeout_ms = timeout.as_millis() as u64, "Delete outlived its timeout");
                self.unsettled_deletes.lock().insert(key.to_string(), pending);
                self.dirty.remove(key);
                Ok(DeleteOutcome::Unsettled)
            }
        }
    }

    /// Whether no delete of `key` is still running in the database
    ///
    /// While one is, a value read from the database may be about to vanish.
    pub fn delete_settled(&self, key: &str) -> bool {
        let mut unsettled = self.unsettled_deletes.lock();
        let Some(pending) = unsettled.get(key) else {
            return true;
        };
        match pending.try_recv() {
            Err(TryRecvError::Empty) => false,
            Ok(_) | Err(TryRecvError::Disconnected) => {
                unsettled.remove(key);
                true
            }
        }
    }

    /// One cycle; caller holds `cycle_lock`
    fn cycle(&self, ignore_backoff: bool) -> FlushReport {
        let mut report = FlushReport::default();
        let batch = self
            .dirty
            .drain_batch(self.config.flush_batch_size, Instant::now(), ignore_backoff);
        if batch.is_empty() {
            return report;
        }

        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        debug!(keys = batch.len(), "Flush cycle started");

        for (priority, items) in batch.into_groups() {
            let map: Batch<V> = items
                .iter()
                .map(|item| (item.key.clone(), item.value.clone()))
                .collect();

            report.batches += 1;
            let timeout = self.config.flush_timeout;
            match self.caller.call(DbOp::BatchSet(map), timeout).into_result(timeout) {
                Ok(()) => self.commit_success(&items, &mut report),
                Err(e) => {
                    warn!(%priority, keys = items.len(), error = %e, "Batch flush failed");
                    report.failed_batches += 1;
                    self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                    self.commit_failure(&items, &e, &mut report);
                }
            }
        }

        self.maybe_compact();

        if report.flushed > 0 || report.failed_batches > 0 {
            info!(
                flushed = report.flushed,
                requeued = report.requeued,
                escalated = report.escalated,
                dirty = self.dirty.size(),
                "Flush cycle finished"
            );
        }
        report
    }

    fn commit_success(&self, items: &[FlushItem<V>], report: &mut FlushReport) {
        let flushed = self.dirty.complete(items);
        report.flushed += items.len();
        self.counters
            .keys_flushed
            .fetch_add(items.len() as u64, Ordering::Relaxed);

        if let Some(log) = &self.log {
            // A lost marker only means a redundant re-flush after recovery
            if let Err(e) = log.mark_flushed(&flushed) {
                warn!(error = %e, keys = flushed.len(), "Failed to mark writes flushed in log");
            }
        }
    }

    fn commit_failure(&self, items: &[FlushItem<V>], cause: &CacheError, report: &mut FlushReport) {
        let cause = cause.to_string();
        let outcomes = self.dirty.requeue(items, self.config.max_retries, &cause, |retries| {
            self.config.backoff_for(retries)
        });

        for outcome in outcomes {
            match outcome {
                RetryOutcome::Requeued {
                    key,
                    retry_count,
                    retry_at,
                } => {
                    report.requeued += 1;
                    debug!(
                        %key,
                        retry_count,
                        backoff_ms = retry_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Requeued dirty key"
                    );
                }
                RetryOutcome::Escalated(letter) => {
                    report.escalated += 1;
                    self.counters.dead_letters.fetch_add(1, Ordering::Relaxed);
                    error!(
                        key = %letter.key,
                        attempts = letter.attempts,
                        error = %letter.last_error,
                        "Retries exhausted, key moved to dead-letter"
                    );
                    self.remember_dead_letter(letter.clone());
                    let _ = self.dead_letter_tx.send(letter);
                }
            }
        }
    }

    fn remember_dead_letter(&self, letter: DeadLetter<V>) {
        let limit = self.config.dead_letter_history;
        if limit == 0 {
            return;
        }
        let mut history = self.dead_letters.lock();
        if history.len() == limit {
            history.pop_front();
        }
        history.push_back(letter);
    }

    /// Compact once the log has doubled since the last compaction
    ///
    /// While the database is down the log is mostly unflushed writes that
    /// compaction cannot drop, so the trigger moves with the surviving size.
    fn maybe_compact(&self) {
        let Some(log) = &self.log else {
            return;
        };
        let size = log.size_bytes();
        if size <= self.compact_at.load(Ordering::Relaxed) {
            return;
        }

        let floor = self.config.log_compact_threshold;
        match log.compact() {
            Ok(result) => {
                self.counters.compactions.fetch_add(1, Ordering::Relaxed);
                self.compact_at
                    .store(floor.max(result.bytes_after.saturating_mul(2)), Ordering::Relaxed);
                info!(
                    kept = result.records_kept,
                    bytes_before = result.bytes_before,
                    bytes_after = result.bytes_after,
                    "Compacted durable log"
                );
            }
            Err(e) => {
                self.compact_at
                    .store(floor.max(size.saturating_mul(2)), Ordering::Relaxed);
                warn!(error = %e, "Log compaction failed");
            }
        }
    }

    /// The most recent dead letters, oldest first
    ///
    /// At most `Config::dead_letter_history` are kept; `stats().dead_letters`
    /// counts all of them.
    pub fn dead_letters(&self) -> Vec<DeadLetter<V>> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            keys_flushed: self.counters.keys_flushed.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            dead_letters: self.counters.dead_letters.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
        }
    }
}
