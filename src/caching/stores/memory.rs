//! # In-Memory Cache Store
//!
//! Bounded in-process cache with TTL expiry, a periodic sweep of expired entries, and importance
//! weighted eviction when the entry limit is exceeded.
//!
//! Eviction first drops everything that has already expired. If the store is still over its
//! limit it removes the least important fifth of the entries (at least enough to get back under
//! the limit), ranked by [`CacheEntry::importance`] with the least recently accessed entry losing
//! ties.

use super::{CacheEntry, CacheOptions, CacheStats, CacheStore, KeyMatcher};
use crate::core::clock::{system_clock, SharedClock};
use crate::core::tasks::BackgroundTask;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// In-memory cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries
    pub max_items: usize,

    /// Cleanup interval for expired entries
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Share of entries removed by one eviction pass
    pub eviction_ratio: f64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            cleanup_interval: Duration::from_secs(5 * 60),
            eviction_ratio: 0.2,
        }
    }
}

struct MemoryInner {
    config: MemoryCacheConfig,
    entries: DashMap<String, CacheEntry>,
    clock: SharedClock,
    eviction_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: AtomicU64,
    total_access_micros: AtomicU64,
    accesses: AtomicU64,
}

/// In-memory cache implementation
pub struct MemoryCacheStore {
    inner: Arc<MemoryInner>,
    sweeper: Mutex<Option<BackgroundTask>>,
}

impl std::fmt::Debug for MemoryCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheStore")
            .field("config", &self.inner.config)
            .field("size", &self.inner.entries.len())
            .finish()
    }
}

impl MemoryCacheStore {
    /// Create a store on the system clock
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a store reading time from `clock`.
    ///
    /// The expiry sweep is started when called inside a tokio runtime.
    pub fn with_clock(config: MemoryCacheConfig, clock: SharedClock) -> Self {
        let inner = Arc::new(MemoryInner {
            config,
            entries: DashMap::new(),
            clock,
            eviction_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_cleanups: AtomicU64::new(0),
            total_access_micros: AtomicU64::new(0),
            accesses: AtomicU64::new(0),
        });

        let sweeper = if tokio::runtime::Handle::try_current().is_ok() {
            let weak = Arc::downgrade(&inner);
            Some(BackgroundTask::spawn_interval(
                "memory-cache-sweep",
                inner.config.cleanup_interval,
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.purge_expired();
                        }
                    }
                },
            ))
        } else {
            None
        };

        info!(
            max_items = inner.config.max_items,
            cleanup_interval = ?inner.config.cleanup_interval,
            "Memory cache initialized"
        );

        Self {
            inner,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Remove expired entries now; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Total evicted entries since creation
    pub fn evictions(&self) -> u64 {
        self.inner.evictions.load(Ordering::Relaxed)
    }

    /// Snapshot of a single entry's metadata
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.entries.get(key).map(|e| e.value().clone())
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.inner.config
    }
}

impl MemoryInner {
    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            self.expired_cleanups.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Cleaned up expired cache entries");
        }
        removed
    }

    fn evict_if_needed(&self) {
        if self.entries.len() <= self.config.max_items {
            return;
        }

        let _guard = self.eviction_lock.lock();
        if self.entries.len() <= self.config.max_items {
            return;
        }

        self.purge_expired();
        let size = self.entries.len();
        if size <= self.config.max_items {
            return;
        }

        let ratio_count = (size as f64 * self.config.eviction_ratio).ceil() as usize;
        let evict_count = ratio_count.max(size - self.config.max_items).min(size);

        let now = self.clock.now();
        let mut ranked: Vec<(String, f64, chrono::DateTime<chrono::Utc>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.importance(now), e.last_accessed_at))
            .collect();

        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.2.cmp(&b.2)));

        let mut evicted = 0;
        for (key, _, _) in ranked.into_iter().take(evict_count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        metrics::counter!(crate::observability::metrics::CACHE_EVICTIONS).increment(evicted as u64);
        info!(evicted, remaining = self.entries.len(), "Evicted least important cache entries");
    }

    fn record_access(&self, started: Instant) {
        self.total_access_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.accesses.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let started = Instant::now();
        let now = self.inner.clock.now();

        let value = match self.inner.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.mark_accessed(now);
                Some(entry.value.clone())
            }
            Some(entry) => {
                drop(entry);
                self.inner
                    .entries
                    .remove_if(key, |_, e| e.is_expired(now));
                None
            }
            None => None,
        };

        if value.is_some() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.record_access(started);
        value
    }

    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> bool {
        let entry = CacheEntry::new(key, value, &options, self.inner.clock.now());
        self.inner.entries.insert(key.to_string(), entry);
        self.inner.evict_if_needed();
        true
    }

    async fn del(&self, key: &str) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        let matcher = KeyMatcher::new(pattern);
        let now = self.inner.clock.now();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    async fn keys_by_tag(&self, tag: &str) -> Vec<String> {
        let now = self.inner.clock.now();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && e.tags.iter().any(|t| t == tag))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    async fn flush_all(&self) -> bool {
        let count = self.inner.entries.len();
        self.inner.entries.clear();
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        self.inner.total_access_micros.store(0, Ordering::Relaxed);
        self.inner.accesses.store(0, Ordering::Relaxed);
        info!(count, "Cleared in-memory cache");
        true
    }

    async fn stats(&self) -> CacheStats {
        CacheStats::compute(
            self.current_cache_type(),
            self.inner.entries.len(),
            self.inner.hits.load(Ordering::Relaxed),
            self.inner.misses.load(Ordering::Relaxed),
            self.inner.total_access_micros.load(Ordering::Relaxed),
            self.inner.accesses.load(Ordering::Relaxed),
        )
    }

    fn current_cache_type(&self) -> String {
        "memory".to_string()
    }

    async fn shutdown(&self) {
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::CachePriority;
    use crate::core::clock::ManualClock;
    use serde_json::json;

    fn store_with_clock(max_items: usize) -> (MemoryCacheStore, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let config = MemoryCacheConfig {
            max_items,
            ..Default::default()
        };
        (MemoryCacheStore::with_clock(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let (cache, _) = store_with_clock(10);

        assert_eq!(cache.get("missing").await, None);
        assert!(cache.set("k", json!({"a": 1}), CacheOptions::default()).await);
        assert_eq!(cache.get("k").await, Some(json!({"a": 1})));
        assert!(cache.del("k").await);
        assert!(!cache.del("k").await);
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let (cache, clock) = store_with_clock(10);
        cache
            .set("q1", json!({"x": 1}), CacheOptions::with_ttl(Duration::from_secs(1)))
            .await;

        assert_eq!(cache.get("q1").await, Some(json!({"x": 1})));
        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get("q1").await, Some(json!({"x": 1})));
        clock.advance(Duration::from_millis(101));
        assert_eq!(cache.get("q1").await, None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_inclusive() {
        let (cache, clock) = store_with_clock(10);
        cache
            .set("edge", json!(1), CacheOptions::with_ttl(Duration::from_secs(2)))
            .await;
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("edge").await, None);
    }

    #[tokio::test]
    async fn test_eviction_keeps_size_bounded_and_prefers_cold_low_priority() {
        let (cache, _) = store_with_clock(5);
        let opts = |p| CacheOptions::with_ttl(Duration::from_secs(3600)).priority(p);

        cache.set("high", json!(1), opts(CachePriority::High)).await;
        cache.set("hot", json!(2), opts(CachePriority::Normal)).await;
        for _ in 0..5 {
            cache.get("hot").await;
        }
        cache.set("low-1", json!(3), opts(CachePriority::Low)).await;
        cache.set("normal", json!(4), opts(CachePriority::Normal)).await;
        cache.set("low-2", json!(5), opts(CachePriority::Low)).await;
        cache.set("trigger", json!(6), opts(CachePriority::Normal)).await;

        assert!(cache.len() <= 5);
        assert_eq!(cache.evictions(), 2);
        assert!(cache.get("low-1").await.is_none());
        assert!(cache.get("low-2").await.is_none());
        assert!(cache.get("high").await.is_some());
        assert!(cache.get("hot").await.is_some());
    }

    #[tokio::test]
    async fn test_eviction_purges_expired_first() {
        let (cache, clock) = store_with_clock(3);
        cache
            .set("short", json!(1), CacheOptions::with_ttl(Duration::from_secs(1)))
            .await;
        cache.set("a", json!(2), CacheOptions::default()).await;
        cache.set("b", json!(3), CacheOptions::default()).await;
        clock.advance(Duration::from_secs(2));
        cache.set("c", json!(4), CacheOptions::default()).await;

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evictions(), 0);
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_keys_and_tags() {
        let (cache, _) = store_with_clock(10);
        cache
            .set("grok:1", json!(1), CacheOptions::default().tags(["grok"]))
            .await;
        cache
            .set("grok:2", json!(2), CacheOptions::default().tags(["grok", "blog"]))
            .await;
        cache
            .set("openai:1", json!(3), CacheOptions::default().tags(["openai"]))
            .await;

        assert_eq!(cache.keys("grok:*").await, vec!["grok:1", "grok:2"]);
        assert_eq!(cache.keys("*:1").await, vec!["grok:1", "openai:1"]);
        assert_eq!(cache.keys_by_tag("blog").await, vec!["grok:2"]);

        assert_eq!(cache.invalidate_tag("grok").await, 2);
        assert_eq!(cache.keys("*").await, vec!["openai:1"]);
    }

    #[tokio::test]
    async fn test_stats_and_flush() {
        let (cache, _) = store_with_clock(10);
        cache.set("key1", json!("value1"), CacheOptions::default()).await;
        cache.get("key1").await;
        cache.get("key2").await;

        let stats = cache.stats().await;
        assert_eq!(stats.cache_type, "memory");
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);

        assert!(cache.flush_all().await);
        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (cache, clock) = store_with_clock(10);
        cache
            .set("a", json!(1), CacheOptions::with_ttl(Duration::from_secs(1)))
            .await;
        cache
            .set("b", json!(2), CacheOptions::with_ttl(Duration::from_secs(60)))
            .await;
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        cache.shutdown().await;
    }
}
