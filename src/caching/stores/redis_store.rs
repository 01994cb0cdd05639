//! # Redis Cache Store
//!
//! Redis-backed [`CacheStore`] with a permanent memory fallback.
//!
//! The store never fails to construct. Connecting is attempted a bounded number of times, each
//! attempt under a timeout; if none succeeds every operation is served by an embedded
//! [`MemoryCacheStore`]. The same happens the first time any Redis command fails: the store flips
//! into degraded mode for good and answers that operation from memory. Only an explicit
//! [`RedisCacheStore::reconnect`] brings Redis back.

use super::{CacheOptions, CacheStats, CacheStore, MemoryCacheConfig, MemoryCacheStore};
use crate::caching::{CacheError, CacheResult};
use crate::core::clock::{system_clock, SharedClock};
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Type reported while Redis is unavailable
pub const FALLBACK_CACHE_TYPE: &str = "memory (fallback)";

/// Redis cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    pub url: String,

    /// Key prefix for all cache entries
    pub key_prefix: String,

    /// Key prefix for tag index sets
    pub tag_prefix: String,

    /// Connection attempts before falling back to memory
    pub max_connection_attempts: u32,

    /// Timeout for a single connection attempt
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Pause between connection attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Configuration of the embedded fallback store
    pub fallback: MemoryCacheConfig,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ai-gateway:cache:".to_string(),
            tag_prefix: "ai-gateway:tags:".to_string(),
            max_connection_attempts: 3,
            connection_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(200),
            fallback: MemoryCacheConfig::default(),
        }
    }
}

type RedisFuture<'a, T> = Pin<Box<dyn Future<Output = RedisResult<T>> + Send + 'a>>;

/// Redis cache implementation
pub struct RedisCacheStore {
    /// Configuration
    config: RedisCacheConfig,

    /// Live connection; `None` while degraded
    connection: RwLock<Option<ConnectionManager>>,

    /// Set once Redis failed; cleared only by `reconnect`
    degraded: AtomicBool,

    /// Serves every operation while degraded
    fallback: MemoryCacheStore,

    /// Scores tag members by the expiry of the entry they point at
    clock: SharedClock,

    /// Statistics counters
    hits: AtomicU64,
    misses: AtomicU64,
    total_access_micros: AtomicU64,
    accesses: AtomicU64,
    connection_errors: AtomicU64,
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("url", &self.config.url)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl RedisCacheStore {
    /// Connect to Redis, falling back to memory when that is not possible
    pub async fn connect(config: RedisCacheConfig) -> Self {
        Self::connect_with_clock(config, system_clock()).await
    }

    /// Like [`RedisCacheStore::connect`] with an explicit clock for the fallback store
    pub async fn connect_with_clock(config: RedisCacheConfig, clock: SharedClock) -> Self {
        let fallback = MemoryCacheStore::with_clock(config.fallback.clone(), clock.clone());
        let connection = Self::establish(&config).await;
        let degraded = connection.is_none();

        if degraded {
            warn!(url = %config.url, "Redis unavailable, serving cache from memory");
        } else {
            info!(url = %config.url, "Redis cache connected");
        }

        Self {
            config,
            connection: RwLock::new(connection),
            degraded: AtomicBool::new(degraded),
            fallback,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            total_access_micros: AtomicU64::new(0),
            accesses: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
        }
    }

    /// Bounded connection attempts, each under `connection_timeout`
    async fn establish(config: &RedisCacheConfig) -> Option<ConnectionManager> {
        let client = match Client::open(config.url.as_str()) {
            Ok(client) => client,
            Err(e) => {
                error!(url = %config.url, error = %e, "Invalid Redis URL");
                return None;
            }
        };

        let attempts = config.max_connection_attempts.max(1);
        for attempt in 1..=attempts {
            debug!(attempt, attempts, "Connecting to Redis");
            match tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client.clone())).await {
                Ok(Ok(manager)) => return Some(manager),
                Ok(Err(e)) => warn!(attempt, error = %e, "Redis connection attempt failed"),
                Err(_) => warn!(attempt, timeout = ?config.connection_timeout, "Redis connection attempt timed out"),
            }
            if attempt < attempts {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        None
    }

    /// Whether operations are currently served from memory
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of Redis command failures observed
    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    /// Try to restore the Redis backend. Returns whether Redis is in use afterwards.
    pub async fn reconnect(&self) -> bool {
        info!(url = %self.config.url, "Attempting Redis reconnect");
        match Self::establish(&self.config).await {
            Some(manager) => {
                *self.connection.write() = Some(manager);
                self.degraded.store(false, Ordering::Release);
                info!("Reconnected to Redis");
                true
            }
            None => {
                self.degraded.store(true, Ordering::Release);
                warn!("Redis reconnect failed, staying on memory fallback");
                false
            }
        }
    }

    /// Get the full cache key with prefix
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}{}", self.config.tag_prefix, tag)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn strip_prefix<'a>(&self, full_key: &'a str) -> &'a str {
        full_key.strip_prefix(self.config.key_prefix.as_str()).unwrap_or(full_key)
    }

    fn live_connection(&self) -> Option<ConnectionManager> {
        if self.is_degraded() {
            return None;
        }
        self.connection.read().clone()
    }

    fn degrade(&self, err: &CacheError) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!(error = %err, "Redis operation failed, switching to memory fallback");
            *self.connection.write() = None;
        }
    }

    /// Run a Redis command. `None` means the caller must answer from the fallback store.
    async fn execute<T, F>(&self, operation: F) -> Option<T>
    where
        F: for<'a> FnOnce(&'a mut ConnectionManager) -> RedisFuture<'a, T>,
    {
        let mut conn = self.live_connection()?;
        let result: CacheResult<T> = operation(&mut conn).await.map_err(CacheError::from);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.degrade(&e);
                None
            }
        }
    }

    async fn scan(&self, pattern: String) -> Option<Vec<String>> {
        self.execute(move |conn| {
            Box::pin(async move {
                let mut cursor: u64 = 0;
                let mut all_keys = Vec::new();

                loop {
                    let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(1000)
                        .query_async(conn)
                        .await?;

                    all_keys.extend(keys);

                    if new_cursor == 0 {
                        break;
                    }
                    cursor = new_cursor;
                }

                Ok::<_, redis::RedisError>(all_keys)
            })
        })
        .await
    }

    fn record_access(&self, started: Instant) {
        self.total_access_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.accesses.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let started = Instant::now();
        let full_key = self.full_key(key);

        let raw = match self
            .execute(move |conn| Box::pin(async move { conn.get::<_, Option<String>>(&full_key).await }))
            .await
        {
            Some(raw) => raw,
            None => return self.fallback.get(key).await,
        };

        let value = raw.and_then(|raw| match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable Redis cache value");
                None
            }
        });

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Redis cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Redis cache miss");
        }
        self.record_access(started);
        value
    }

    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> bool {
        let serialized = match serde_json::to_string(&value) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache value");
                return false;
            }
        };

        let full_key = self.full_key(key);
        let ttl_ms = options.ttl.as_millis().max(1) as u64;
        let tag_keys: Vec<String> = options.tags.iter().map(|t| self.tag_key(t)).collect();
        let now_ms = self.now_ms();
        let expires_at_ms = now_ms.saturating_add(ttl_ms as i64);

        let stored = self
            .execute(move |conn| {
                Box::pin(async move {
                    let mut pipe = redis::pipe();
                    pipe.cmd("SET")
                        .arg(&full_key)
                        .arg(&serialized)
                        .arg("PX")
                        .arg(ttl_ms)
                        .ignore();
                    // Tag sets are sorted by entry expiry and pruned on every write
                    for tag_key in &tag_keys {
                        pipe.cmd("ZADD")
                            .arg(tag_key)
                            .arg(expires_at_ms)
                            .arg(&full_key)
                            .ignore();
                        pipe.cmd("ZREMRANGEBYSCORE")
                            .arg(tag_key)
                            .arg("-inf")
                            .arg(now_ms)
                            .ignore();
                    }
                    pipe.query_async::<_, ()>(conn).await
                })
            })
            .await;

        match stored {
            Some(()) => {
                debug!(key = %key, ttl = ?options.ttl, "Set Redis cache key");
                true
            }
            None => self.fallback.set(key, value, options).await,
        }
    }

    async fn del(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        match self
            .execute(move |conn| Box::pin(async move { conn.del::<_, i64>(&full_key).await }))
            .await
        {
            Some(deleted) => deleted > 0,
            None => self.fallback.del(key).await,
        }
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        let full_pattern = format!("{}{}", self.config.key_prefix, pattern);
        match self.scan(full_pattern).await {
            Some(keys) => {
                let mut keys: Vec<String> = keys.iter().map(|k| self.strip_prefix(k).to_string()).collect();
                keys.sort();
                keys.dedup();
                keys
            }
            None => self.fallback.keys(pattern).await,
        }
    }

    async fn keys_by_tag(&self, tag: &str) -> Vec<String> {
        let tag_key = self.tag_key(tag);
        let now_ms = self.now_ms();
        let members = self
            .execute(move |conn| {
                Box::pin(async move {
                    let mut pipe = redis::pipe();
                    pipe.cmd("ZREMRANGEBYSCORE")
                        .arg(&tag_key)
                        .arg("-inf")
                        .arg(now_ms)
                        .ignore();
                    pipe.cmd("ZRANGE").arg(&tag_key).arg(0).arg(-1);
                    let (members,): (Vec<String>,) = pipe.query_async(conn).await?;
                    if members.is_empty() {
                        return Ok::<_, redis::RedisError>(members);
                    }

                    let mut pipe = redis::pipe();
                    for member in &members {
                        pipe.cmd("EXISTS").arg(member);
                    }
                    let exists: Vec<bool> = pipe.query_async(conn).await?;

                    let (live, stale): (Vec<_>, Vec<_>) = members
                        .into_iter()
                        .zip(exists)
                        .partition(|(_, exists)| *exists);
                    if !stale.is_empty() {
                        let stale: Vec<String> = stale.into_iter().map(|(k, _)| k).collect();
                        conn.zrem::<_, _, ()>(&tag_key, stale).await?;
                    }
                    Ok(live.into_iter().map(|(k, _)| k).collect::<Vec<String>>())
                })
            })
            .await;

        match members {
            Some(members) => {
                let mut keys: Vec<String> = members.iter().map(|k| self.strip_prefix(k).to_string()).collect();
                keys.sort();
                keys
            }
            None => self.fallback.keys_by_tag(tag).await,
        }
    }

    async fn flush_all(&self) -> bool {
        let mut keys = match self.scan(format!("{}*", self.config.key_prefix)).await {
            Some(keys) => keys,
            None => return self.fallback.flush_all().await,
        };
        match self.scan(format!("{}*", self.config.tag_prefix)).await {
            Some(tag_keys) => keys.extend(tag_keys),
            None => return self.fallback.flush_all().await,
        }

        if !keys.is_empty() {
            let count = keys.len();
            let deleted = self
                .execute(move |conn| Box::pin(async move { conn.del::<_, i64>(&keys).await }))
                .await;
            if deleted.is_none() {
                return self.fallback.flush_all().await;
            }
            info!(count, "Cleared keys from Redis cache");
        }

        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.total_access_micros.store(0, Ordering::Relaxed);
        self.accesses.store(0, Ordering::Relaxed);
        true
    }

    async fn stats(&self) -> CacheStats {
        if let Some(keys) = self.scan(format!("{}*", self.config.key_prefix)).await {
            return CacheStats::compute(
                "redis",
                keys.len(),
                self.hits.load(Ordering::Relaxed),
                self.misses.load(Ordering::Relaxed),
                self.total_access_micros.load(Ordering::Relaxed),
                self.accesses.load(Ordering::Relaxed),
            );
        }

        let mut stats = self.fallback.stats().await;
        stats.cache_type = FALLBACK_CACHE_TYPE.to_string();
        stats
    }

    fn current_cache_type(&self) -> String {
        if self.is_degraded() {
            FALLBACK_CACHE_TYPE.to_string()
        } else {
            "redis".to_string()
        }
    }

    async fn shutdown(&self) {
        self.fallback.shutdown().await;
        self.connection.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unreachable_config() -> RedisCacheConfig {
        RedisCacheConfig {
            url: "redis://127.0.0.1:1".to_string(),
            max_connection_attempts: 2,
            connection_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back_to_memory() {
        let cache = RedisCacheStore::connect(unreachable_config()).await;

        assert!(cache.is_degraded());
        assert_eq!(cache.current_cache_type(), "memory (fallback)");

        assert!(cache.set("q1", json!({"x": 1}), CacheOptions::default()).await);
        assert_eq!(cache.get("q1").await, Some(json!({"x": 1})));
        assert_eq!(cache.keys("q*").await, vec!["q1"]);
        assert!(cache.del("q1").await);

        let stats = cache.stats().await;
        assert_eq!(stats.cache_type, "memory (fallback)");
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_url_falls_back_to_memory() {
        let cache = RedisCacheStore::connect(RedisCacheConfig {
            url: "not a url".to_string(),
            ..unreachable_config()
        })
        .await;
        assert!(cache.is_degraded());
        assert!(cache.set("k", json!(1), CacheOptions::default()).await);
        assert_eq!(cache.get("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_reconnect_against_unreachable_stays_degraded() {
        let cache = RedisCacheStore::connect(unreachable_config()).await;
        assert!(!cache.reconnect().await);
        assert_eq!(cache.current_cache_type(), FALLBACK_CACHE_TYPE);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_live_redis_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let cache = RedisCacheStore::connect(RedisCacheConfig {
            url,
            key_prefix: "ai-gateway-test:cache:".to_string(),
            tag_prefix: "ai-gateway-test:tags:".to_string(),
            ..Default::default()
        })
        .await;
        assert_eq!(cache.current_cache_type(), "redis");

        cache.flush_all().await;
        assert!(
            cache
                .set("q1", json!({"x": 1}), CacheOptions::with_ttl(Duration::from_secs(1)).tags(["t"]))
                .await
        );
        assert_eq!(cache.get("q1").await, Some(json!({"x": 1})));
        assert_eq!(cache.keys_by_tag("t").await, vec!["q1"]);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("q1").await, None);
        assert!(cache.keys_by_tag("t").await.is_empty());
        cache.flush_all().await;
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_tag_sets_pruned_on_write() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let cache = RedisCacheStore::connect(RedisCacheConfig {
            url: url.clone(),
            key_prefix: "ai-gateway-prune:cache:".to_string(),
            tag_prefix: "ai-gateway-prune:tags:".to_string(),
            ..Default::default()
        })
        .await;
        cache.flush_all().await;

        for i in 0..20 {
            let options = CacheOptions::with_ttl(Duration::from_millis(50)).tags(["completion"]);
            assert!(cache.set(&format!("short{i}"), json!(i), options).await);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let options = CacheOptions::with_ttl(Duration::from_secs(60)).tags(["completion"]);
        assert!(cache.set("long", json!("kept"), options).await);

        let mut conn = ConnectionManager::new(Client::open(url.as_str()).unwrap()).await.unwrap();
        let members: u64 = conn.zcard("ai-gateway-prune:tags:completion").await.unwrap();
        assert_eq!(members, 1);
        assert_eq!(cache.keys_by_tag("completion").await, vec!["long"]);
        cache.flush_all().await;
    }
}
