//! In-memory counting store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::counter::CounterRecord;
use super::store::CounterStore;
use crate::error::StoreError;

/// A counting store held in process memory.
///
/// Each key lives in a `DashMap` shard; the shard lock is held for the whole
/// read-modify-write of an increment, which makes it atomic per key without
/// a global lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Counter records indexed by identity key
    counters: DashMap<String, CounterRecord>,
    /// Set while `injected_failure` holds a reason; increments only take
    /// the lock when this is set
    failing: AtomicBool,
    /// Error returned by every increment while set
    injected_failure: Mutex<Option<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent increment fail with `reason`, or clear the
    /// failure with `None`.
    pub fn fail_with(&self, reason: Option<&str>) {
        let mut failure = self.injected_failure.lock();
        *failure = reason.map(str::to_string);
        self.failing.store(failure.is_some(), Ordering::Release);
    }

    /// Reason set by [`fail_with`](Self::fail_with), if any.
    fn injected_failure(&self) -> Option<String> {
        if !self.failing.load(Ordering::Acquire) {
            return None;
        }
        self.injected_failure.lock().clone()
    }

    /// Get the count of the live window for `key`, if any.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.count())
    }

    /// Get the number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every record whose window has closed.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, record| record.is_live(now));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, "Purged expired counters");
        }
        removed
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        if let Some(reason) = self.injected_failure() {
            return Err(StoreError::Unavailable(reason));
        }

        let now = Instant::now();
        let count = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().hit(now, window),
            Entry::Vacant(vacant) => vacant.insert(CounterRecord::open(now, window)).count(),
        };

        trace!(key, count, "Incremented in-memory counter");
        Ok(count)
    }
}
