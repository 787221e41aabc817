//! In-process backend.
//!
//! Implements [`CacheBackend`] on a `DashMap`, so each key's operations are
//! serialized by the map's shard lock. Expiry is lazy and driven by the
//! injected [`Clock`].

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::CacheBackend;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SwarmGuardError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<f64>,
}

impl StoredValue {
    fn new(value: Value, ttl_secs: Option<u64>, now: f64) -> Self {
        Self {
            value,
            expires_at: ttl_secs.map(|ttl| now + ttl as f64),
        }
    }

    fn is_expired(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// A [`CacheBackend`] living in process memory.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store on wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability. An unavailable store fails every call, which
    /// stands in for an unreachable remote backend.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwarmGuardError::Backend("memory store unavailable".to_string()))
        }
    }

    /// Drop `key` if it has expired, then return the current time.
    fn evict_expired(&self, key: &str) -> f64 {
        let now = self.clock.now();
        self.entries.remove_if(key, |_, v| v.is_expired(now));
        now
    }
}

fn wrong_type(key: &str) -> SwarmGuardError {
    SwarmGuardError::Backend(format!("WRONGTYPE operation against key {}", key))
}

#[async_trait]
impl CacheBackend for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        self.evict_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s.clone())),
                Value::ZSet(_) => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        self.check_available()?;
        let now = self.clock.now();
        self.entries.insert(
            key.to_string(),
            StoredValue::new(Value::Str(value.to_string()), ttl_secs, now),
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let stored = StoredValue::new(Value::Str(value.to_string()), Some(ttl_secs), now);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(matches!(self.entries.remove(key), Some((_, v)) if !v.is_expired(now)))
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        self.check_available()?;
        let now = self.evict_expired(key);
        Ok(self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| (at - now).ceil().max(0.0) as u64))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check_available()?;
        let now = self.evict_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(Value::ZSet(HashMap::new()), None, now));
        match &mut entry.value {
            Value::ZSet(set) => {
                set.insert(member.to_string(), score);
                trace!(key = %key, member = %member, score = score, "zadd");
                Ok(())
            }
            Value::Str(_) => Err(wrong_type(key)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.check_available()?;
        self.evict_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::ZSet(set) => Ok(set.len() as u64),
                Value::Str(_) => Err(wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>> {
        self.check_available()?;
        self.evict_expired(key);
        let mut members: Vec<(String, f64)> = match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::ZSet(set) => set.iter().map(|(m, s)| (m.clone(), *s)).collect(),
                Value::Str(_) => return Err(wrong_type(key)),
            },
            None => return Ok(Vec::new()),
        };
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let len = members.len() as isize;
        let start = if start < 0 { (start + len).max(0) } else { start };
        let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(members[start as usize..=stop as usize].to_vec())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.check_available()?;
        self.evict_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::ZSet(set) => {
                    let before = set.len();
                    set.retain(|_, score| *score < min || *score > max);
                    Ok((before - set.len()) as u64)
                }
                Value::Str(_) => Err(wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        self.check_available()?;
        let now = self.evict_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(now + ttl_secs as f64);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(start: f64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(start));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_set_get_with_expiry() {
        let (clock, store) = store_at(0.0);
        store.set("k", "v", Some(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl("k").await.unwrap(), Some(10));

        clock.advance(10.0);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (clock, store) = store_at(0.0);
        assert!(store.set_if_absent("lock:a", "n1", 2).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "n2", 2).await.unwrap());

        clock.advance(2.0);
        assert!(store.set_if_absent("lock:a", "n2", 2).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn test_sorted_set_operations() {
        let (_clock, store) = store_at(0.0);
        store.zadd("z", "c", 3.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();

        assert_eq!(store.zcard("z").await.unwrap(), 3);
        let all = store.zrange("z", 0, -1).await.unwrap();
        let names: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let first = store.zrange("z", 0, 0).await.unwrap();
        assert_eq!(first, vec![("a".to_string(), 1.0)]);
        let last = store.zrange("z", -1, -1).await.unwrap();
        assert_eq!(last, vec![("c".to_string(), 3.0)]);

        assert_eq!(store.zrem_range_by_score("z", f64::NEG_INFINITY, 2.0).await.unwrap(), 2);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zrange_out_of_bounds() {
        let (_clock, store) = store_at(0.0);
        assert!(store.zrange("missing", 0, -1).await.unwrap().is_empty());
        store.zadd("z", "a", 1.0).await.unwrap();
        assert!(store.zrange("z", 5, 10).await.unwrap().is_empty());
        assert_eq!(store.zrange("z", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let (_clock, store) = store_at(0.0);
        store.set("s", "v", None).await.unwrap();
        assert!(store.zadd("s", "m", 1.0).await.is_err());
        store.zadd("z", "m", 1.0).await.unwrap();
        assert!(store.get("z").await.is_err());
    }

    #[tokio::test]
    async fn test_expire_and_delete() {
        let (clock, store) = store_at(0.0);
        store.zadd("z", "m", 1.0).await.unwrap();
        assert!(store.expire("z", 5).await.unwrap());
        assert!(!store.expire("missing", 5).await.unwrap());

        clock.advance(6.0);
        assert_eq!(store.zcard("z").await.unwrap(), 0);

        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let (_clock, store) = store_at(0.0);
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.get("k").await.is_err());
        store.set_available(true);
        tokio_test::assert_ok!(store.ping().await);
    }
}
