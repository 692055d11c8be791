use crate::error::{ThrottleError, ThrottleResult};
use crate::rate_limit_config::Limits;
use envconfig::Envconfig;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Root of the throttle section in a configuration document.
pub const THROTTLE_CONFIG_ROOT: &str = "security.throttle";

pub const DEFAULT_MAX_ATTEMPTS: u64 = 60;
pub const DEFAULT_DECAY_SECONDS: u64 = 60;

/// Which backend holds throttle records for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    Memory,
    Database,
    Redis,
}

impl FromStr for StorageDriver {
    type Err = ThrottleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageDriver::Memory),
            "database" | "sqlite" => Ok(StorageDriver::Database),
            "redis" => Ok(StorageDriver::Redis),
            other => Err(ThrottleError::Configuration(format!(
                "Unknown throttle storage '{}', expected memory, database or redis",
                other
            ))),
        }
    }
}

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Backend for throttle records
    #[envconfig(from = "THROTTLE_STORAGE", default = "memory")]
    pub storage: StorageDriver,

    /// Redis connection URL
    #[envconfig(from = "REDIS_URL", default = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// SQLite connection URL
    #[envconfig(from = "DATABASE_URL", default = "sqlite::memory:")]
    pub database_url: String,

    /// JSON document with the `security.throttle` section
    #[envconfig(from = "THROTTLE_CONFIG")]
    pub throttle_config: Option<String>,

    /// Seconds between sweeps of expired records in memory storage
    #[envconfig(from = "CLEANUP_INTERVAL", default = "300")]
    pub cleanup_interval_secs: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }
}

/// Read access to nested configuration values by dotted key.
pub trait ConfigRepository: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}

/// A configuration document held as a JSON tree.
#[derive(Debug, Clone, Default)]
pub struct JsonConfig {
    root: Value,
}

impl JsonConfig {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn from_file(path: impl AsRef<Path>) -> ThrottleResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ThrottleError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::new(serde_json::from_str(&contents)?))
    }
}

impl ConfigRepository for JsonConfig {
    fn get(&self, key: &str) -> Option<Value> {
        key.split('.')
            .try_fold(&self.root, |value, part| value.as_object()?.get(part))
            .cloned()
    }
}

/// Throttle settings with built-in defaults for anything missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSettings {
    /// When false every request passes through uncounted.
    pub enabled: bool,
    pub defaults: Limits,
    /// Paths that are never throttled; exact or `*` globs.
    pub except: Vec<String>,
    pub trusted_proxies: Vec<String>,
    /// Table of the database backend.
    pub table: String,
    /// Key prefix of the Redis backend.
    pub prefix: String,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            defaults: Limits::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_DECAY_SECONDS),
            except: Vec::new(),
            trusted_proxies: Vec::new(),
            table: "throttle_requests".to_string(),
            prefix: "throttle:".to_string(),
        }
    }
}

impl ThrottleSettings {
    pub fn from_repository(repository: Option<&dyn ConfigRepository>) -> Self {
        let mut settings = Self::default();
        let Some(repository) = repository else {
            return settings;
        };

        settings.enabled = read(repository, "enabled", Value::as_bool, settings.enabled);
        let max_attempts = read(repository, "max_attempts", positive, settings.defaults.max_attempts);
        let decay_seconds = read(repository, "decay_seconds", positive, settings.defaults.decay_seconds);
        settings.defaults = Limits::new(max_attempts, decay_seconds);
        settings.except = read(repository, "except", string_list, settings.except);
        settings.trusted_proxies = read(repository, "trusted_proxies", string_list, settings.trusted_proxies);
        settings.table = read(repository, "table", non_empty_string, settings.table);
        settings.prefix = read(repository, "prefix", |v| v.as_str().map(str::to_string), settings.prefix);

        settings
    }
}

fn read<T>(
    repository: &dyn ConfigRepository,
    name: &str,
    parse: impl Fn(&Value) -> Option<T>,
    default: T,
) -> T {
    let key = format!("{}.{}", THROTTLE_CONFIG_ROOT, name);
    match repository.get(&key) {
        None | Some(Value::Null) => default,
        Some(value) => parse(&value).unwrap_or_else(|| {
            warn!(key = %key, value = %value, "Ignoring invalid throttle setting");
            default
        }),
    }
}

/// A positive integer given as a number or a numeric string.
pub(crate) fn positive(value: &Value) -> Option<u64> {
    let number = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }?;
    (number > 0).then_some(number)
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

fn non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
