//! Sliding window counter.
//!
//! Each admitted attempt is a member of a per-key sorted set scored by its
//! timestamp. Pruning, counting and inserting are separate backend calls, so
//! under heavy concurrent writes a key can briefly overshoot its limit by a
//! few attempts. No in-process lock is taken.

use std::sync::Arc;
use tracing::trace;

use super::key::RateLimitKey;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::CacheBackend;

/// A rolling-window admission counter bound to one key and one limit.
#[derive(Clone)]
pub struct SlidingWindowCounter {
    store: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    key: RateLimitKey,
    max_attempts: u64,
    window_secs: u64,
}

impl std::fmt::Debug for SlidingWindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowCounter")
            .field("key", &self.key)
            .field("max_attempts", &self.max_attempts)
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

impl SlidingWindowCounter {
    /// Create a counter. Limits below 1 are raised to 1.
    pub fn new(
        store: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        key: RateLimitKey,
        max_attempts: u64,
        window_secs: u64,
    ) -> Self {
        Self {
            store,
            clock,
            key,
            max_attempts: max_attempts.max(1),
            window_secs: window_secs.max(1),
        }
    }

    /// A transient counter over the same window with a different limit.
    pub fn with_limit(&self, max_attempts: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self.clone()
        }
    }

    /// The counted key.
    pub fn key(&self) -> &RateLimitKey {
        &self.key
    }

    /// Attempts admitted per window.
    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Drop attempts that have left the window and return the surviving count.
    async fn prune(&self, now: f64) -> Result<u64> {
        let cache_key = self.key.cache_key();
        let cutoff = now - self.window_secs as f64;
        self.store
            .zrem_range_by_score(&cache_key, f64::NEG_INFINITY, cutoff)
            .await?;
        self.store.zcard(&cache_key).await
    }

    /// Record an attempt if the window has room. Returns whether it was admitted.
    pub async fn attempt(&self) -> Result<bool> {
        let now = self.clock.now();
        let count = self.prune(now).await?;

        if count >= self.max_attempts {
            trace!(key = %self.key, count = count, limit = self.max_attempts, "Window full");
            return Ok(false);
        }

        let cache_key = self.key.cache_key();
        let member = format!("{:.6}-{}", now, uuid::Uuid::new_v4().simple());
        self.store.zadd(&cache_key, &member, now).await?;
        self.store.expire(&cache_key, self.window_secs).await?;

        trace!(key = %self.key, count = count + 1, limit = self.max_attempts, "Attempt recorded");
        Ok(true)
    }

    /// Whether an attempt would currently be admitted, without recording one.
    pub async fn would_admit(&self) -> Result<bool> {
        let now = self.clock.now();
        Ok(self.prune(now).await? < self.max_attempts)
    }

    /// Attempts currently inside the window.
    pub async fn count(&self) -> Result<u64> {
        self.prune(self.clock.now()).await
    }

    /// Attempts left before the window is full.
    pub async fn remaining(&self) -> Result<u64> {
        Ok(self.max_attempts.saturating_sub(self.count().await?))
    }

    /// Whether the window is full.
    pub async fn is_exceeded(&self) -> Result<bool> {
        Ok(self.count().await? >= self.max_attempts)
    }

    /// Seconds until the oldest attempt leaves the window; zero when empty.
    pub async fn retry_after(&self) -> Result<u64> {
        let now = self.clock.now();
        self.prune(now).await?;

        let oldest = self.store.zrange(&self.key.cache_key(), 0, 0).await?;
        Ok(match oldest.first() {
            Some((_, recorded_at)) => {
                (recorded_at + self.window_secs as f64 - now).ceil().max(0.0) as u64
            }
            None => 0,
        })
    }

    /// Forget every attempt for this key.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete(&self.key.cache_key()).await?;
        Ok(())
    }
}
