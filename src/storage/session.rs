use super::{ThrottleRecord, ThrottleStorage};
use crate::error::ThrottleResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The slice of a client session the throttle storage needs.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn insert(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
}

/// A session kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().map(|values| values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySession {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn insert(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }
}

/// Throttle records kept in the client's session.
///
/// Sessions are not shared between clients, so this backend has no atomic
/// increment. Two processes writing the same session can lose attempts.
pub struct SessionThrottleStorage<S> {
    session: S,
    prefix: String,
}

impl<S: SessionStore> SessionThrottleStorage<S> {
    pub fn new(session: S) -> Self {
        Self::with_prefix(session, "throttle:")
    }

    pub fn with_prefix(session: S, prefix: impl Into<String>) -> Self {
        Self {
            session,
            prefix: prefix.into(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    fn session_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl<S: SessionStore> ThrottleStorage for SessionThrottleStorage<S> {
    async fn get(&self, key: &str) -> ThrottleResult<Option<ThrottleRecord>> {
        // Anything that is not a record reads as absent.
        Ok(self
            .session
            .get(&self.session_key(key))
            .and_then(|value| serde_json::from_value(value).ok()))
    }

    async fn put(&self, key: &str, record: ThrottleRecord) -> ThrottleResult<()> {
        let value = serde_json::to_value(record)?;
        self.session.insert(&self.session_key(key), value);
        Ok(())
    }

    async fn forget(&self, key: &str) -> ThrottleResult<()> {
        self.session.remove(&self.session_key(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_then_get_round_trips_record() {
        let storage = SessionThrottleStorage::new(MemorySession::new());
        let record = ThrottleRecord::new(4, 1234);

        tokio_test::block_on(async {
            storage.put("abc", record).await.unwrap();
            assert_eq!(storage.get("abc").await.unwrap(), Some(record));
        });
    }

    #[tokio::test]
    async fn test_keys_are_prefixed_in_session() {
        let session = MemorySession::new();
        let storage = SessionThrottleStorage::with_prefix(session.clone(), "limits.");

        storage.put("abc", ThrottleRecord::new(1, 10)).await.unwrap();

        assert!(session.get("limits.abc").is_some());
        assert!(session.get("abc").is_none());
    }

    #[tokio::test]
    async fn test_malformed_session_value_reads_as_absent() {
        let session = MemorySession::new();
        session.insert("throttle:abc", json!("not a record"));
        let storage = SessionThrottleStorage::new(session);

        assert_eq!(storage.get("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_forget_is_idempotent() {
        let storage = SessionThrottleStorage::new(MemorySession::new());
        storage.put("abc", ThrottleRecord::new(1, 10)).await.unwrap();

        storage.forget("abc").await.unwrap();
        storage.forget("abc").await.unwrap();

        assert!(storage.get("abc").await.unwrap().is_none());
        assert!(storage.session().is_empty());
    }

    #[test]
    fn test_session_storage_is_not_atomic() {
        let storage = SessionThrottleStorage::new(MemorySession::new());
        assert!(storage.as_atomic().is_none());
    }
}
