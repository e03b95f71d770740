//! TTL key/value cache with hit/miss statistics.
//!
//! There is no background eviction: expiry is checked lazily when an entry is
//! read, and an expired entry counts as a miss. Time is read from
//! `tokio::time::Instant` so tests can drive expiry with a paused clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;

struct CacheEntry<V> {
    data: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Snapshot of cache effectiveness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Hits divided by total lookups, `0.0` before the first lookup.
    pub hit_rate: f64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub cache_size: usize,
}

/// A string-keyed cache whose entries expire after a TTL.
pub struct FieldCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> FieldCache<V> {
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

    /// Store `data` under `key` with the default TTL.
    pub fn set(&self, key: impl Into<String>, data: V) {
        self.set_with_ttl(key, data, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, data: V, ttl: Duration) {
        let key = key.into();
        trace!(%key, ttl_ms = ttl.as_millis() as u64, "cache set");
        self.entries.insert(
            key,
            CacheEntry {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a live entry. Absent and expired entries count as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.data.clone()));

        match lookup {
            Some(Some(data)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(%key, "cache hit");
                Some(data)
            }
            Some(None) => {
                // Shard guard from `get` is released before removing.
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(%key, "cache miss (expired)");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(%key, "cache miss");
                None
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`. Returns how many were removed.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Drop all entries. Statistics are kept.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        CacheStats {
            hit_rate: if total == 0 {
                0.0
            } else {
                hit_count as f64 / total as f64
            },
            hit_count,
            miss_count,
            cache_size: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_what_was_set() {
        let cache = FieldCache::new(Duration::from_secs(60));
        cache.set("fields:all", vec![1, 2, 3]);
        assert_eq!(cache.get("fields:all"), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("fields:none"), None);

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.cache_size, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_cache_has_zero_hit_rate() {
        let cache: FieldCache<u8> = FieldCache::new(Duration::from_secs(1));
        assert_eq!(cache.stats().hit_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_miss_and_are_evicted_on_read() {
        let cache = FieldCache::new(Duration::from_secs(300));
        cache.set("groups", "g");
        cache.set_with_ttl("short", "s", Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("groups"), Some("g"));
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(cache.get("groups"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().miss_count, 2);
    }

    #[test]
    fn delete_and_prefix_invalidation() {
        let cache = FieldCache::new(Duration::from_secs(60));
        cache.set("fields:category:switches", 1);
        cache.set("fields:category:lights", 2);
        cache.set("mappings", 3);

        assert!(cache.delete("mappings"));
        assert!(!cache.delete("mappings"));
        assert_eq!(cache.delete_prefix("fields:category:"), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_keeps_statistics() {
        let cache = FieldCache::new(Duration::from_secs(60));
        cache.set("a", 1);
        cache.get("a");
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.hit_count, 1);
    }
}
