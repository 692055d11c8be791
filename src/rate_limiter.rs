//! Attempt counting over a [`ThrottleStorage`] backend.

use crate::clock::{Clock, SystemClock};
use crate::error::ThrottleResult;
use crate::storage::{ThrottleRecord, ThrottleStorage};
use std::sync::Arc;
use tracing::trace;

/// Result of counting one attempt and deciding on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub attempts: u64,
    pub remaining: u64,
    pub limited: bool,
    pub retry_after: u64,
}

/// Counts attempts per key inside a fixed window.
///
/// When the backend offers an atomic increment the limiter uses it for
/// every count. Otherwise it reads, mutates and writes the record, which can
/// undercount concurrent attempts on the same key.
#[derive(Clone)]
pub struct RateLimiter {
    storage: Arc<dyn ThrottleStorage>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(storage: Arc<dyn ThrottleStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn ThrottleStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn storage(&self) -> &Arc<dyn ThrottleStorage> {
        &self.storage
    }

    /// Whether `key` has used up `max_attempts` in its current window.
    ///
    /// An expired record is deleted on the way.
    pub async fn too_many_attempts(&self, key: &str, max_attempts: u64) -> ThrottleResult<bool> {
        let Some(record) = self.storage.get(key).await? else {
            return Ok(false);
        };

        if record.is_expired(self.now()) {
            self.clear(key).await?;
            return Ok(false);
        }

        Ok(record.attempts >= max_attempts)
    }

    /// Count one attempt against `key` and return the attempts in the window.
    pub async fn hit(&self, key: &str, decay_seconds: u64) -> ThrottleResult<u64> {
        let now = self.now();

        if let Some(atomic) = self.storage.as_atomic() {
            let record = atomic.increment(key, decay_seconds, now).await?;
            return Ok(record.attempts);
        }

        let mut record = match self.storage.get(key).await? {
            Some(record) if !record.is_expired(now) => record,
            _ => ThrottleRecord::new(0, now.saturating_add(decay_seconds)),
        };
        record.attempts += 1;

        self.storage.put(key, record).await?;
        Ok(record.attempts)
    }

    /// Count an attempt and decide whether it is over the limit.
    ///
    /// The atomic path always counts, so the attempt that crosses the limit
    /// is recorded and `limited` means `attempts > max_attempts`. The other
    /// path checks first and does not count attempts that are already limited.
    pub async fn attempt(
        &self,
        key: &str,
        max_attempts: u64,
        decay_seconds: u64,
    ) -> ThrottleResult<AttemptOutcome> {
        if let Some(atomic) = self.storage.as_atomic() {
            let now = self.now();
            let record = atomic.increment(key, decay_seconds, now).await?;
            trace!(key = %key, attempts = record.attempts, "Atomic attempt");

            return Ok(AttemptOutcome {
                attempts: record.attempts,
                remaining: max_attempts.saturating_sub(record.attempts),
                limited: record.attempts > max_attempts,
                retry_after: record.expires_at.saturating_sub(now),
            });
        }

        if self.too_many_attempts(key, max_attempts).await? {
            return Ok(AttemptOutcome {
                attempts: max_attempts,
                remaining: 0,
                limited: true,
                retry_after: self.available_in(key).await?,
            });
        }

        let attempts = self.hit(key, decay_seconds).await?;
        trace!(key = %key, attempts, "Attempt");

        Ok(AttemptOutcome {
            attempts,
            remaining: max_attempts.saturating_sub(attempts),
            limited: false,
            retry_after: 0,
        })
    }

    /// Seconds until the window of `key` closes, `0` without a record.
    pub async fn available_in(&self, key: &str) -> ThrottleResult<u64> {
        Ok(self
            .storage
            .get(key)
            .await?
            .map(|record| record.expires_at.saturating_sub(self.now()))
            .unwrap_or(0))
    }

    pub async fn clear(&self, key: &str) -> ThrottleResult<()> {
        self.storage.forget(key).await
    }
}
