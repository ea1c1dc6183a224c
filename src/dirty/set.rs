//! DirtySet implementation
//!
//! HashMap of records plus a BTreeMap drain index, under one Mutex so every
//! operation is atomic with respect to the others.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{DeadLetter, DirtyRecord, FlushBatch, FlushItem, Priority, RetryOutcome};

struct DirtyInner<V> {
    records: HashMap<String, DirtyRecord<V>>,

    /// Drain order: (priority, order) → key
    index: BTreeMap<(Priority, u64), String>,

    next_order: u64,
    next_generation: u64,
    in_flight: usize,
}

/// Tracks keys with unflushed writes
pub struct DirtySet<V> {
    inner: Mutex<DirtyInner<V>>,
}

impl<V: Clone> DirtySet<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DirtyInner {
                records: HashMap::new(),
                index: BTreeMap::new(),
                next_order: 0,
                next_generation: 0,
                in_flight: 0,
            }),
        }
    }

    /// Insert or overwrite the record for `key`
    ///
    /// An existing record keeps its retry count, backoff and queue position;
    /// its priority only ever moves to the more urgent of old and new.
    /// Returns `true` if the write coalesced into an existing record.
    pub fn mark_dirty(&self, key: &str, value: V, priority: Priority, log_seq: Option<u64>) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.next_generation += 1;
        let generation = inner.next_generation;

        if let Some(record) = inner.records.get_mut(key) {
            record.value = value;
            record.generation = generation;
            if log_seq.is_some() {
                record.log_seq = log_seq;
            }
            if priority < record.priority {
                // Keeps its first-marked order within the new bucket
                inner.index.remove(&(record.priority, record.order));
                record.priority = priority;
                inner.index.insert((record.priority, record.order), key.to_string());
            }
            return true;
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner.index.insert((priority, order), key.to_string());
        inner.records.insert(
            key.to_string(),
            DirtyRecord {
                key: key.to_string(),
                value,
                first_marked_at: Instant::now(),
                priority,
                retry_count: 0,
                log_seq,
                generation,
                in_flight: false,
                retry_at: None,
                order,
            },
        );
        false
    }

    /// Take up to `max_size` records in drain order, flagging them in-flight
    ///
    /// Records already in flight are skipped, as are records still backing
    /// off at `now` unless `ignore_backoff` is set.
    pub fn drain_batch(&self, max_size: usize, now: Instant, ignore_backoff: bool) -> FlushBatch<V> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut items = Vec::new();

        for key in inner.index.values() {
            if items.len() >= max_size {
                break;
            }
            let Some(record) = inner.records.get_mut(key) else {
                continue;
            };
            if record.in_flight {
                continue;
            }
            if !ignore_backoff && record.retry_at.is_some_and(|at| at > now) {
                continue;
            }

            record.in_flight = true;
            items.push(FlushItem {
                key: record.key.clone(),
                value: record.value.clone(),
                priority: record.priority,
                generation: record.generation,
                log_seq: record.log_seq,
            });
        }

        inner.in_flight += items.len();
        FlushBatch { items }
    }

    /// Commit a successful flush of `items`
    ///
    /// Records unchanged since the drain are removed. Records rewritten while
    /// in flight stay dirty with a cleared failure history. Returns the
    /// `(key, log_seq)` pairs that are now safe to mark flushed in the log.
    pub fn complete(&self, items: &[FlushItem<V>]) -> Vec<(String, u64)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut flushed = Vec::with_capacity(items.len());

        for item in items {
            if let Some(seq) = item.log_seq {
                flushed.push((item.key.clone(), seq));
            }
            let Some(record) = inner.records.get_mut(&item.key) else {
                continue;
            };
            if !record.in_flight {
                continue;
            }
            inner.in_flight -= 1;

            if record.generation == item.generation {
                let (priority, order) = (record.priority, record.order);
                inner.records.remove(&item.key);
                inner.index.remove(&(priority, order));
            } else {
                record.in_flight = false;
                record.retry_count = 0;
                record.retry_at = None;
            }
        }
        flushed
    }

    /// Return failed `items` to the set, or escalate those out of retries
    ///
    /// `backoff` maps the new retry count to the delay before the key may
    /// be attempted again.
    pub fn requeue<F>(
        &self,
        items: &[FlushItem<V>],
        max_retries: u32,
        error: &str,
        backoff: F,
    ) -> Vec<RetryOutcome<V>>
    where
        F: Fn(u32) -> Duration,
    {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut outcomes = Vec::with_capacity(items.len());

        for item in items {
            let Some(record) = inner.records.get_mut(&item.key) else {
                continue;
            };
            if !record.in_flight {
                continue;
            }
            inner.in_flight -= 1;
            record.in_flight = false;
            record.retry_count += 1;

            if record.retry_count > max_retries {
                let (priority, order) = (record.priority, record.order);
                if let Some(record) = inner.records.remove(&item.key) {
                    inner.index.remove(&(priority, order));
                    outcomes.push(RetryOutcome::Escalated(DeadLetter {
                        key: record.key,
                        value: record.value,
                        attempts: record.retry_count,
                        last_error: error.to_string(),
                        log_seq: record.log_seq,
                    }));
                }
            } else {
                let retry_at = now + backoff(record.retry_count);
                record.retry_at = Some(retry_at);
                outcomes.push(RetryOutcome::Requeued {
                    key: record.key.clone(),
                    retry_count: record.retry_count,
                    retry_at,
                });
            }
        }
        outcomes
    }

    /// Drop the record for `key`, whatever its state
    pub fn remove(&self, key: &str) -> Option<DirtyRecord<V>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let record = inner.records.remove(key)?;
        inner.index.remove(&(record.priority, record.order));
        if record.in_flight {
            inner.in_flight -= 1;
        }
        Some(record)
    }

    /// Snapshot of the record for `key`
    pub fn get(&self, key: &str) -> Option<DirtyRecord<V>> {
        self.inner.lock().records.get(key).cloned()
    }

    /// Dirty keys in drain order
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().index.values().cloned().collect()
    }

    /// Number of dirty keys (in flight included)
    pub fn size(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}

impl<V: Clone> Default for DirtySet<V> {
    fn default() -> Self {
        Self::new()
    }
}
