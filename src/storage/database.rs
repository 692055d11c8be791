use super::{AtomicThrottleStorage, ThrottleRecord, ThrottleStorage};
use crate::error::ThrottleResult;
use crate::validation::{validate_storage_key, validate_table_name};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Default table holding one row per throttle key.
pub const DEFAULT_TABLE: &str = "throttle_requests";

/// How [`DatabaseThrottleStorage`] performs an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementStrategy {
    /// One `INSERT .. ON CONFLICT DO UPDATE .. RETURNING` statement.
    Upsert,
    /// Lock, re-read and write inside a transaction.
    Transaction,
}

/// Throttle records persisted in SQLite.
#[derive(Debug, Clone)]
pub struct DatabaseThrottleStorage {
    pool: SqlitePool,
    table: String,
    strategy: IncrementStrategy,
}

impl DatabaseThrottleStorage {
    pub async fn new(pool: SqlitePool) -> ThrottleResult<Self> {
        Self::with_table(pool, DEFAULT_TABLE).await
    }

    /// Use `table` and pick the increment strategy the engine supports.
    pub async fn with_table(pool: SqlitePool, table: &str) -> ThrottleResult<Self> {
        validate_table_name(table)?;

        let version = sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
            .fetch_one(&pool)
            .await?;
        let strategy = if supports_returning(&version) {
            IncrementStrategy::Upsert
        } else {
            IncrementStrategy::Transaction
        };
        debug!(version = %version, strategy = ?strategy, "Selected increment strategy");

        Ok(Self {
            pool,
            table: table.to_string(),
            strategy,
        })
    }

    /// Open a pool for `url`, e.g. `sqlite://throttle.db` or `sqlite::memory:`.
    ///
    /// A missing database file is created.
    pub async fn connect(url: &str, table: &str) -> ThrottleResult<Self> {
        info!("Creating SQLite throttle storage pool");

        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // An in-memory database lives and dies with its single connection.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .connect_with(options)
            .await?;

        let storage = Self::with_table(pool, table).await?;
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn with_strategy(mut self, strategy: IncrementStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> IncrementStrategy {
        self.strategy
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the throttle table if it does not exist yet.
    pub async fn migrate(&self) -> ThrottleResult<()> {
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                "key" VARCHAR(191) PRIMARY KEY NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER NOT NULL DEFAULT 0
            )"#,
            self.table
        ))
        .execute(&self.pool)
        .await?;

        info!(table = %self.table, "Throttle table ready");
        Ok(())
    }

    async fn increment_upsert(
        &self,
        key: &str,
        decay_seconds: u64,
        now: u64,
    ) -> ThrottleResult<ThrottleRecord> {
        let expires_at = now.saturating_add(decay_seconds);
        let sql = format!(
            r#"INSERT INTO "{t}" ("key", attempts, expires_at) VALUES (?, 1, ?)
            ON CONFLICT("key") DO UPDATE SET
                attempts = CASE WHEN "{t}".expires_at <= ? THEN 1 ELSE "{t}".attempts + 1 END,
                expires_at = CASE WHEN "{t}".expires_at <= ? THEN excluded.expires_at ELSE "{t}".expires_at END
            RETURNING attempts, expires_at"#,
            t = self.table
        );

        let (attempts, expires_at) = sqlx::query_as::<_, (i64, i64)>(&sql)
            .bind(key)
            .bind(to_db(expires_at))
            .bind(to_db(now))
            .bind(to_db(now))
            .fetch_one(&self.pool)
            .await?;

        Ok(ThrottleRecord::new(from_db(attempts), from_db(expires_at)))
    }

    async fn increment_transaction(
        &self,
        key: &str,
        decay_seconds: u64,
        now: u64,
    ) -> ThrottleResult<ThrottleRecord> {
        let mut tx = self.pool.begin().await?;

        // A write statement takes SQLite's write lock before the row is read.
        sqlx::query(&format!(
            r#"UPDATE "{}" SET attempts = attempts WHERE "key" = ?"#,
            self.table
        ))
        .bind(key)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, (i64, i64)>(&format!(
            r#"SELECT attempts, expires_at FROM "{}" WHERE "key" = ?"#,
            self.table
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let record = match row {
            None => {
                let record = ThrottleRecord::first(now, decay_seconds);
                sqlx::query(&format!(
                    r#"INSERT INTO "{}" ("key", attempts, expires_at) VALUES (?, ?, ?)"#,
                    self.table
                ))
                .bind(key)
                .bind(to_db(record.attempts))
                .bind(to_db(record.expires_at))
                .execute(&mut *tx)
                .await?;
                record
            }
            Some((_, expires_at)) if from_db(expires_at) <= now => {
                let record = ThrottleRecord::first(now, decay_seconds);
                sqlx::query(&format!(
                    r#"UPDATE "{}" SET attempts = ?, expires_at = ? WHERE "key" = ?"#,
                    self.table
                ))
                .bind(to_db(record.attempts))
                .bind(to_db(record.expires_at))
                .bind(key)
                .execute(&mut *tx)
                .await?;
                record
            }
            Some((attempts, expires_at)) => {
                let record = ThrottleRecord::new(from_db(attempts) + 1, from_db(expires_at));
                sqlx::query(&format!(
                    r#"UPDATE "{}" SET attempts = ? WHERE "key" = ?"#,
                    self.table
                ))
                .bind(to_db(record.attempts))
                .bind(key)
                .execute(&mut *tx)
                .await?;
                record
            }
        };

        tx.commit().await?;
        Ok(record)
    }
}

#[async_trait]
impl ThrottleStorage for DatabaseThrottleStorage {
    async fn get(&self, key: &str) -> ThrottleResult<Option<ThrottleRecord>> {
        let row = sqlx::query_as::<_, (i64, i64)>(&format!(
            r#"SELECT attempts, expires_at FROM "{}" WHERE "key" = ?"#,
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(attempts, expires_at)| ThrottleRecord::new(from_db(attempts), from_db(expires_at))))
    }

    async fn put(&self, key: &str, record: ThrottleRecord) -> ThrottleResult<()> {
        validate_storage_key(key)?;

        sqlx::query(&format!(
            r#"INSERT INTO "{}" ("key", attempts, expires_at) VALUES (?, ?, ?)
            ON CONFLICT("key") DO UPDATE SET
                attempts = excluded.attempts,
                expires_at = excluded.expires_at"#,
            self.table
        ))
        .bind(key)
        .bind(to_db(record.attempts))
        .bind(to_db(record.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn forget(&self, key: &str) -> ThrottleResult<()> {
        sqlx::query(&format!(r#"DELETE FROM "{}" WHERE "key" = ?"#, self.table))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn as_atomic(&self) -> Option<&dyn AtomicThrottleStorage> {
        Some(self)
    }
}

#[async_trait]
impl AtomicThrottleStorage for DatabaseThrottleStorage {
    async fn increment(
        &self,
        key: &str,
        decay_seconds: u64,
        now: u64,
    ) -> ThrottleResult<ThrottleRecord> {
        validate_storage_key(key)?;

        match self.strategy {
            IncrementStrategy::Upsert => self.increment_upsert(key, decay_seconds, now).await,
            IncrementStrategy::Transaction => {
                self.increment_transaction(key, decay_seconds, now).await
            }
        }
    }
}

/// `RETURNING` arrived in SQLite 3.35.
fn supports_returning(version: &str) -> bool {
    let mut parts = version.split('.').map(|part| part.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (major, minor) >= (3, 35)
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
