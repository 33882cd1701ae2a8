// ipd-store: the key/value+hash contract the scheduler and metadata
// service share, with a Redis backend and an in-memory backend.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod keys;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Store failure: transport loss or protocol error from the backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store error: {0}")]
    Store(String),
}

/// The key/value+hash operations ipd relies on.
///
/// A deliberately narrow contract so that tests can substitute
/// [`MemoryStore`] for the Redis backend. `sadd` reports whether the
/// member was new; an existing member is data, not an error.
#[async_trait]
pub trait Store: Send + Sync {
    /// Add a member to a set; returns true when the set grew.
    async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError>;
    async fn srem(&self, set: &str, member: &str) -> Result<(), StoreError>;
    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment an integer counter, returning the new value.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Set several hash fields in one call. Phase writes that must appear
    /// atomically to readers go through a single `hmset`.
    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Transactionally delete a key and remove a set member (the project
    /// unregister path).
    async fn del_and_srem(&self, key: &str, set: &str, member: &str) -> Result<(), StoreError>;
}
