//! Response cache with per-tier freshness.
//!
//! Entries remember only when they were written. The TTL applied on lookup
//! comes from the *caller's* tier: protected lookups demand fresher entries
//! than throttleable ones, so a recent background result can still answer
//! a user request.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use serde_json::Value;
use throttle_core::ThrottleConfig;
use tokio::time::Instant;
use tracing::debug;

use crate::types::PriorityTier;

struct CacheEntry {
    value: Value,
    written: Instant,
}

/// LRU-bounded key → value store with tier-dependent TTL.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    protected_ttl: Duration,
    background_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize, protected_ttl: Duration, background_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            protected_ttl,
            background_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(
            config.cache_capacity,
            config.protected_cache_ttl(),
            config.background_cache_ttl(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Freshness required by lookups from `tier`.
    pub fn ttl_for(&self, tier: PriorityTier) -> Duration {
        if tier.is_protected() {
            self.protected_ttl
        } else {
            self.background_ttl
        }
    }

    fn max_ttl(&self) -> Duration {
        self.protected_ttl.max(self.background_ttl)
    }

    /// Return the cached value if it is fresh enough for `tier`.
    ///
    /// Entries past the longest TTL are removed on the spot; entries that are
    /// merely too old for this tier stay for less demanding callers.
    pub fn get(&self, key: &str, tier: PriorityTier) -> Option<Value> {
        let now = Instant::now();
        let ttl = self.ttl_for(tier);
        let mut entries = self.lock();

        let age = match entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.written),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if age < ttl {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entries.get(key).map(|e| e.value.clone());
        }

        if age >= self.max_ttl() {
            entries.pop(key);
            debug!(key, "evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value stamped with the current time.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.lock().put(
            key.into(),
            CacheEntry {
                value,
                written: Instant::now(),
            },
        );
    }

    /// Sweep entries older than the longest TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let max_ttl = self.max_ttl();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.written) >= max_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), remaining = entries.len(), "swept response cache");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
