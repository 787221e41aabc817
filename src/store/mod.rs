//! Shared cache/coordination backend.
//!
//! Every piece of state that must be visible to more than one node lives
//! behind [`CacheBackend`]. Individual operations are expected to be atomic;
//! nothing here combines several operations into a transaction.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Key-value and sorted-set primitives consumed by the engine.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Verify the backend is reachable.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value. `ttl_secs` of `None` keeps the value until deleted.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Store a value only if the key is absent. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime of a key, `None` if it is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Members ordered by ascending score, with Redis-style inclusive indices
    /// (negative indices count from the end).
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>>;

    /// Remove members whose score lies in `[min, max]`. Returns the number removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// Set a key's expiry. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;
}

/// Read and decode a JSON record. Undecodable data is reported as an error so
/// the caller decides whether it means "absent".
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CacheBackend,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and store a JSON record.
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn CacheBackend,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl_secs).await
}
