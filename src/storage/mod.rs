//! Storage backends for throttle records.
//!
//! Every backend maps an opaque key to a [`ThrottleRecord`]. Backends that can
//! count in a single round trip also implement [`AtomicThrottleStorage`] and
//! advertise it through [`ThrottleStorage::as_atomic`]; the limiter falls back
//! to a read-modify-write sequence for the rest. That fallback can lose
//! updates when two requests race on the same key.

mod database;
mod memory;
mod redis;
mod session;

pub use self::database::{DatabaseThrottleStorage, IncrementStrategy};
pub use self::memory::MemoryThrottleStorage;
pub use self::redis::RedisThrottleStorage;
pub use self::session::{MemorySession, SessionStore, SessionThrottleStorage};

use crate::error::ThrottleResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Attempts counted against one key and the moment the window closes.
///
/// `expires_at == 0` means no expiry is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThrottleRecord {
    pub attempts: u64,
    pub expires_at: u64,
}

impl ThrottleRecord {
    pub fn new(attempts: u64, expires_at: u64) -> Self {
        Self {
            attempts,
            expires_at,
        }
    }

    /// First attempt of a fresh window.
    pub fn first(now: u64, decay_seconds: u64) -> Self {
        Self::new(1, now.saturating_add(decay_seconds))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }
}

#[async_trait]
pub trait ThrottleStorage: Send + Sync {
    async fn get(&self, key: &str) -> ThrottleResult<Option<ThrottleRecord>>;

    /// Insert or replace the record for `key`.
    async fn put(&self, key: &str, record: ThrottleRecord) -> ThrottleResult<()>;

    /// Delete the record for `key`. Deleting a missing key is not an error.
    async fn forget(&self, key: &str) -> ThrottleResult<()>;

    /// The atomic capability of this backend, if it has one.
    fn as_atomic(&self) -> Option<&dyn AtomicThrottleStorage> {
        None
    }
}

#[async_trait]
pub trait AtomicThrottleStorage: ThrottleStorage {
    /// Count one attempt in a single operation.
    ///
    /// Starts a new window of `decay_seconds` when the key is absent or
    /// expired, otherwise increments the attempts of the current window.
    async fn increment(
        &self,
        key: &str,
        decay_seconds: u64,
        now: u64,
    ) -> ThrottleResult<ThrottleRecord>;
}
