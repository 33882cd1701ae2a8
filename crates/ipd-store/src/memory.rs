//! In-memory store backend.
//!
//! Implements the same contract as the Redis backend over process-local
//! maps. Used by the test suites and usable for single-process
//! development runs where no Redis is available.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Store, StoreError};

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// A `Mutex<HashMap>`-backed [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(members) = inner.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut members: Vec<String> = inner
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = match inner.strings.get(key) {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| StoreError::Store(format!("{} is not an integer", key)))?,
            None => 0,
        };
        let next = current + 1;
        inner.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn del_and_srem(&self, key: &str, set: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        if let Some(members) = inner.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[tokio::test]
    async fn test_sadd_reports_new_member() {
        let store = MemoryStore::new();
        assert!(store.sadd("projects", "demo").await.unwrap());
        assert!(!store.sadd("projects", "demo").await.unwrap());
        assert!(store.sadd("projects", "other").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let store = MemoryStore::new();
        assert_eq!(store.get("project:demo").await.unwrap(), None);
        store.set("project:demo", "https://example.com/demo.git").await.unwrap();
        assert_eq!(
            store.get("project:demo").await.unwrap().as_deref(),
            Some("https://example.com/demo.git")
        );
        store.del("project:demo").await.unwrap();
        assert_eq!(store.get("project:demo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.incr(keys::BUILDS_COUNTER).await.unwrap(), 1);
        assert_eq!(store.incr(keys::BUILDS_COUNTER).await.unwrap(), 2);
        assert_eq!(store.incr(keys::BUILDS_COUNTER).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_incr_readable_as_string() {
        let store = MemoryStore::new();
        store.incr(keys::BUILDS_COUNTER).await.unwrap();
        store.incr(keys::BUILDS_COUNTER).await.unwrap();
        assert_eq!(
            store.get(keys::BUILDS_COUNTER).await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();
        let key = keys::build(1);
        store
            .hmset(
                &key,
                &[
                    ("status".to_string(), "waiting".to_string()),
                    ("project_key".to_string(), "demo".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            store.hget(&key, "status").await.unwrap().as_deref(),
            Some("waiting")
        );
        assert_eq!(store.hget(&key, "missing").await.unwrap(), None);

        store
            .hmset(&key, &[("status".to_string(), "running".to_string())])
            .await
            .unwrap();
        let all = store.hgetall(&key).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("status").map(String::as_str), Some("running"));
    }

    #[tokio::test]
    async fn test_hgetall_missing_key_is_empty() {
        let store = MemoryStore::new();
        assert!(store.hgetall("instancedata:nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_del_and_srem_removes_both() {
        let store = MemoryStore::new();
        store.sadd("projects", "demo").await.unwrap();
        store.set("project:demo", "url").await.unwrap();

        store
            .del_and_srem("project:demo", "projects", "demo")
            .await
            .unwrap();

        assert_eq!(store.get("project:demo").await.unwrap(), None);
        assert!(store.smembers("projects").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_smembers_sorted() {
        let store = MemoryStore::new();
        store.sadd("projects", "zeta").await.unwrap();
        store.sadd("projects", "alpha").await.unwrap();
        assert_eq!(
            store.smembers("projects").await.unwrap(),
            vec!["alpha".to_string(), "zeta".to_string()]
        );
    }
}
