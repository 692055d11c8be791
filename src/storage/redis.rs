use super::{AtomicThrottleStorage, ThrottleRecord, ThrottleStorage};
use crate::clock::{Clock, SystemClock};
use crate::error::ThrottleResult;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::Arc;
use tracing::{info, warn};

/// Creates the key with a TTL on first use, gives a TTL to keys that lost
/// theirs, then increments. Returns `{attempts, now + ttl}`.
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local decay = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local ttl = redis.call('ttl', key)

if ttl == -2 then
    redis.call('set', key, 1, 'ex', decay)
    return {1, now + decay}
end

if ttl == -1 then
    redis.call('expire', key, decay)
    ttl = decay
end

local attempts = redis.call('incr', key)
return {attempts, now + ttl}
"#;

/// Throttle records kept in Redis as plain counters with a TTL.
#[derive(Clone)]
pub struct RedisThrottleStorage {
    connection: ConnectionManager,
    prefix: String,
    clock: Arc<dyn Clock>,
    script: Script,
}

impl RedisThrottleStorage {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            prefix: "throttle:".to_string(),
            clock: Arc::new(SystemClock),
            script: Script::new(INCREMENT_SCRIPT),
        }
    }

    pub async fn connect(redis_url: &str) -> ThrottleResult<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis throttle storage");
        Ok(Self::new(connection))
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Clock used to turn TTLs into expiry timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn ping(&self) -> ThrottleResult<String> {
        let mut conn = self.connection.clone();
        Ok(redis::cmd("PING").query_async::<_, String>(&mut conn).await?)
    }
}

#[async_trait]
impl ThrottleStorage for RedisThrottleStorage {
    async fn get(&self, key: &str) -> ThrottleResult<Option<ThrottleRecord>> {
        let redis_key = self.redis_key(key);
        let mut conn = self.connection.clone();

        let value: Option<String> = redis::cmd("GET")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;
        let Some(value) = value else {
            return Ok(None);
        };

        let ttl: i64 = redis::cmd("TTL").arg(&redis_key).query_async(&mut conn).await?;
        let expires_at = if ttl > 0 {
            self.clock.now() + ttl as u64
        } else {
            0
        };

        Ok(Some(ThrottleRecord::new(
            value.trim().parse().unwrap_or(0),
            expires_at,
        )))
    }

    async fn put(&self, key: &str, record: ThrottleRecord) -> ThrottleResult<()> {
        let redis_key = self.redis_key(key);
        let mut conn = self.connection.clone();

        if record.expires_at > 0 {
            // SETEX rejects a zero TTL.
            let ttl = record.expires_at.saturating_sub(self.clock.now()).max(1);
            redis::cmd("SETEX")
                .arg(&redis_key)
                .arg(ttl)
                .arg(record.attempts)
                .query_async::<_, ()>(&mut conn)
                .await?;
        } else {
            redis::cmd("SET")
                .arg(&redis_key)
                .arg(record.attempts)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        Ok(())
    }

    async fn forget(&self, key: &str) -> ThrottleResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    fn as_atomic(&self) -> Option<&dyn AtomicThrottleStorage> {
        Some(self)
    }
}

#[async_trait]
impl AtomicThrottleStorage for RedisThrottleStorage {
    async fn increment(
        &self,
        key: &str,
        decay_seconds: u64,
        now: u64,
    ) -> ThrottleResult<ThrottleRecord> {
        let mut conn = self.connection.clone();

        let reply: Vec<i64> = self
            .script
            .key(self.redis_key(key))
            .arg(decay_seconds)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [attempts, expires_at, ..] => Ok(ThrottleRecord::new(
                u64::try_from(*attempts).unwrap_or(0),
                u64::try_from(*expires_at).unwrap_or(0),
            )),
            _ => {
                warn!(key = %key, "Unexpected increment script reply, starting a new window");
                Ok(ThrottleRecord::first(now, decay_seconds))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn storage() -> RedisThrottleStorage {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisThrottleStorage::connect(&url)
            .await
            .unwrap()
            .with_prefix("throttle-guard-test:")
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_put_get_round_trip_against_redis() {
        let clock = Arc::new(ManualClock::new(crate::clock::SystemClock.now()));
        let storage = storage().await.with_clock(clock.clone());
        storage.forget("round-trip").await.unwrap();

        let record = ThrottleRecord::new(3, clock.now() + 30);
        storage.put("round-trip", record).await.unwrap();

        assert_eq!(storage.get("round-trip").await.unwrap(), Some(record));
        storage.forget("round-trip").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_increment_against_redis() {
        let storage = storage().await;
        storage.forget("incr").await.unwrap();

        let first = storage.increment("incr", 60, 1000).await.unwrap();
        assert_eq!(first, ThrottleRecord::new(1, 1060));

        let second = storage.increment("incr", 60, 1000).await.unwrap();
        assert_eq!(second.attempts, 2);

        storage.forget("incr").await.unwrap();
        assert_eq!(storage.get("incr").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_increment_gives_persistent_key_a_ttl() {
        let storage = storage().await;
        storage.put("persistent", ThrottleRecord::new(2, 0)).await.unwrap();
        assert_eq!(storage.get("persistent").await.unwrap(), Some(ThrottleRecord::new(2, 0)));

        let record = storage.increment("persistent", 60, 1000).await.unwrap();
        assert_eq!(record, ThrottleRecord::new(3, 1060));

        let stored = storage.get("persistent").await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert!(stored.expires_at > 0);

        storage.forget("persistent").await.unwrap();
    }
}
