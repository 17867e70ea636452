//! Bounded TTL cache for values that are expensive to recompute
//!
//! Used for photo fingerprints: photos are content addressed, so a
//! fingerprint never changes for a given content hash, and re-checks of
//! pending evidence would otherwise download and hash every photo again.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

// ============================================================================
// LRU Cache
// ============================================================================

/// LRU cache with a time-to-live per entry
pub struct LruCache<K, V> {
    max_entries: usize,
    ttl: Duration,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    stats: CacheStats,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed: Instant,
}

/// Hit/miss counters
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "hits": self.hits(),
            "misses": self.misses(),
            "evictions": self.evictions(),
            "hit_rate": self.hit_rate(),
        })
    }
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Fresh value for `key`, refreshing its recency.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;

        match entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.last_accessed = Instant::now();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_accessed: now,
            },
        );
    }

    /// Cached value, or compute and cache it. Errors are not cached.
    ///
    /// The lock is not held while `compute` runs, so concurrent misses for
    /// one key may both compute; the later insert wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Drop expired entries.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() <= self.ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let cache = LruCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(cache.get(&"a").await, Some(1));

        cache.insert("c", 3).await;

        assert_eq!(cache.get(&"b").await, None);
        assert_eq!(cache.get(&"a").await, Some(1));
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = LruCache::new(8, Duration::from_millis(5));
        cache.insert("k", "v").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.get(&"k").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: LruCache<&str, u64> = LruCache::new(8, Duration::from_secs(60));

        let first: Result<u64, &str> = cache
            .get_or_try_insert_with("photo", || async { Err("storage down") })
            .await;
        assert!(first.is_err());

        let second: Result<u64, &str> = cache
            .get_or_try_insert_with("photo", || async { Ok(7) })
            .await;
        assert_eq!(second, Ok(7));
        assert_eq!(cache.get(&"photo").await, Some(7));
        assert!(cache.stats().hit_rate() > 0.0);
    }
}
