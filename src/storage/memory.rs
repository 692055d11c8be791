use super::{AtomicThrottleStorage, ThrottleRecord, ThrottleStorage};
use crate::error::ThrottleResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Increments between two sweeps of expired records.
pub const SWEEP_EVERY: u64 = 1024;

/// Process-local storage.
///
/// Increments run under the shard lock of the key's entry, so concurrent
/// requests in one process never lose a count. Nothing is shared between
/// processes. Expired records are dropped every [`SWEEP_EVERY`] increments
/// and by [`MemoryThrottleStorage::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryThrottleStorage {
    records: DashMap<String, ThrottleRecord>,
    increments: AtomicU64,
}

impl MemoryThrottleStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record whose window has closed at `now`; returns how many.
    pub fn purge_expired(&self, now: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());

        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Purged expired throttle records");
        }
        removed
    }
}

#[async_trait]
impl ThrottleStorage for MemoryThrottleStorage {
    async fn get(&self, key: &str) -> ThrottleResult<Option<ThrottleRecord>> {
        Ok(self.records.get(key).map(|record| *record))
    }

    async fn put(&self, key: &str, record: ThrottleRecord) -> ThrottleResult<()> {
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn forget(&self, key: &str) -> ThrottleResult<()> {
        self.records.remove(key);
        Ok(())
    }

    fn as_atomic(&self) -> Option<&dyn AtomicThrottleStorage> {
        Some(self)
    }
}

#[async_trait]
impl AtomicThrottleStorage for MemoryThrottleStorage {
    async fn increment(
        &self,
        key: &str,
        decay_seconds: u64,
        now: u64,
    ) -> ThrottleResult<ThrottleRecord> {
        if self.increments.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired(now);
        }

        let mut entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| ThrottleRecord::new(0, now.saturating_add(decay_seconds)));

        if entry.expires_at <= now {
            *entry = ThrottleRecord::new(0, now.saturating_add(decay_seconds));
        }
        entry.attempts += 1;

        Ok(*entry)
    }
}
