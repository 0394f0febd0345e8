//! In-process TTL cache
//!
//! String keys, per-entry absolute expiry, lazy eviction. Expired entries stay
//! in memory until a `get`, `invalidate_prefix` or `clear` touches them; there
//! is no background sweeper.
//!
//! Time comes from `tokio::time::Instant` so tests can drive expiry with a
//! paused clock.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default entry lifetime (5 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A cached value and the instant after which it is no longer visible
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// Visible while `now <= expires_at`
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Generic TTL cache (thread-safe)
///
/// Keys are opaque; callers build collision-free keys themselves
/// (e.g. `db:select:<sql>:<params>`).
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Value for `key` if present and unexpired. A stale entry is evicted.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();

        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key, "Cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => {}
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key, "Cache miss");
                return None;
            }
        }

        // Re-check under the write lock: a concurrent set may have refreshed it
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            debug!(key, "Evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store with the default TTL, overwriting any existing entry
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store with an explicit TTL, overwriting any existing entry
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(key.into(), CacheEntry::new(value, ttl));
    }

    /// Cached value, or run `producer` once, cache its output and return it.
    ///
    /// A producer error is returned as-is and nothing is cached.
    pub async fn get_or_set<F, Fut, E>(&self, key: &str, producer: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_or_set_with_ttl(key, producer, self.default_ttl)
            .await
    }

    pub async fn get_or_set_with_ttl<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = producer().await?;
        self.set_with_ttl(key, value.clone(), ttl);
        Ok(value)
    }

    /// Remove every entry whose key starts with `prefix`; returns how many went
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });

        debug!(prefix, removed, "Cache prefix invalidated");
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        debug!("Cache cleared");
    }

    /// Entries physically held, expired-but-unevicted ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        (self.hits as f64) / (lookups as f64)
    }
}
