//! # Cache Factory
//!
//! Chooses, builds and rebuilds the active [`CacheStore`] for a gateway context. There is one
//! factory per [`GatewayContext`](crate::gateway::GatewayContext); nothing here is process global.
//!
//! The factory never fails. A Redis backend that cannot be reached is still returned (it serves
//! from its embedded memory store), and after a bounded number of failed Redis initialisations the
//! factory stops trying Redis and builds plain memory stores until the next reset.

use super::stores::{CacheStats, CacheStore, MemoryCacheConfig, MemoryCacheStore, RedisCacheConfig, RedisCacheStore};
use crate::core::clock::{system_clock, SharedClock};
use crate::core::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Cache type reported before the first initialisation
pub const NO_CACHE_TYPE: &str = "none";

/// Requested cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
    /// Redis when a URL is configured, memory otherwise
    Auto,
}

impl CacheBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheBackendKind::Memory => "memory",
            CacheBackendKind::Redis => "redis",
            CacheBackendKind::Auto => "auto",
        }
    }

    /// Backend used when nothing is configured
    pub fn default_for(environment: &str) -> Self {
        if environment.eq_ignore_ascii_case("development") {
            CacheBackendKind::Memory
        } else {
            CacheBackendKind::Auto
        }
    }
}

impl fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheBackendKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheBackendKind::Memory),
            "redis" => Ok(CacheBackendKind::Redis),
            "auto" => Ok(CacheBackendKind::Auto),
            other => Err(GatewayError::config(format!(
                "Unknown cache type '{}', expected memory, redis or auto",
                other
            ))),
        }
    }
}

/// Factory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheFactoryConfig {
    /// Requested backend
    pub backend: CacheBackendKind,

    /// Memory backend settings
    pub memory: MemoryCacheConfig,

    /// Redis backend settings; `None` means no Redis URL is configured
    pub redis: Option<RedisCacheConfig>,

    /// Failed Redis initialisations tolerated before sticking to memory
    pub max_redis_init_failures: u32,
}

impl Default for CacheFactoryConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            memory: MemoryCacheConfig::default(),
            redis: None,
            max_redis_init_failures: 3,
        }
    }
}

/// Factory status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFactoryStats {
    pub cache_type: String,
    pub requested_backend: Option<CacheBackendKind>,
    pub redis_init_failures: u32,
    pub initializations: u64,
    pub last_init_at: Option<DateTime<Utc>>,
    pub cache: Option<CacheStats>,
}

#[derive(Default)]
struct FactoryState {
    cache: Option<Arc<dyn CacheStore>>,
    requested: Option<CacheBackendKind>,
    redis_init_failures: u32,
    initializations: u64,
    last_init_at: Option<DateTime<Utc>>,
}

/// Builds and owns the active cache backend
pub struct CacheFactory {
    config: CacheFactoryConfig,
    clock: SharedClock,
    state: Mutex<FactoryState>,
}

impl fmt::Debug for CacheFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFactory")
            .field("backend", &self.config.backend)
            .finish()
    }
}

impl CacheFactory {
    pub fn new(config: CacheFactoryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CacheFactoryConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(FactoryState::default()),
        }
    }

    /// Return the active cache, building it on first use.
    ///
    /// The existing instance is kept unless `force` names a different backend than the one it was
    /// built for.
    pub async fn get_cache(&self, force: Option<CacheBackendKind>) -> Arc<dyn CacheStore> {
        let mut state = self.state.lock().await;
        let requested = force.unwrap_or(self.config.backend);

        if let Some(cache) = &state.cache {
            if force.is_none() || state.requested == Some(requested) {
                return Arc::clone(cache);
            }
        }

        if let Some(old) = state.cache.take() {
            info!(from = %old.current_cache_type(), to = %requested, "Switching cache backend");
            old.shutdown().await;
        }

        self.build(&mut state, requested).await
    }

    /// Tear down the active cache and build a fresh one.
    ///
    /// Also clears the Redis failure count, so Redis is attempted again.
    pub async fn reset_cache(&self, kind: Option<CacheBackendKind>) -> Arc<dyn CacheStore> {
        let mut state = self.state.lock().await;

        if let Some(old) = state.cache.take() {
            old.shutdown().await;
        }
        state.redis_init_failures = 0;

        let requested = kind.or(state.requested).unwrap_or(self.config.backend);
        info!(backend = %requested, "Resetting cache");
        self.build(&mut state, requested).await
    }

    /// `"none"` before the first initialisation
    pub async fn current_cache_type(&self) -> String {
        let state = self.state.lock().await;
        match &state.cache {
            Some(cache) => cache.current_cache_type(),
            None => NO_CACHE_TYPE.to_string(),
        }
    }

    pub async fn stats(&self) -> CacheFactoryStats {
        let state = self.state.lock().await;
        let (cache_type, cache) = match &state.cache {
            Some(cache) => (cache.current_cache_type(), Some(cache.stats().await)),
            None => (NO_CACHE_TYPE.to_string(), None),
        };

        CacheFactoryStats {
            cache_type,
            requested_backend: state.requested,
            redis_init_failures: state.redis_init_failures,
            initializations: state.initializations,
            last_init_at: state.last_init_at,
            cache,
        }
    }

    /// Stop the active cache's background work and forget it
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(cache) = state.cache.take() {
            cache.shutdown().await;
        }
    }

    async fn build(&self, state: &mut FactoryState, requested: CacheBackendKind) -> Arc<dyn CacheStore> {
        let redis_config = match requested {
            CacheBackendKind::Memory => None,
            CacheBackendKind::Redis => Some(self.config.redis.clone().unwrap_or_default()),
            CacheBackendKind::Auto => self.config.redis.clone(),
        };

        let cache: Arc<dyn CacheStore> = match redis_config {
            Some(_) if state.redis_init_failures >= self.config.max_redis_init_failures => {
                warn!(
                    failures = state.redis_init_failures,
                    "Redis initialisation failed too often, using memory cache"
                );
                self.memory_store()
            }
            Some(redis_config) => {
                let store = RedisCacheStore::connect_with_clock(redis_config, Arc::clone(&self.clock)).await;
                if store.is_degraded() {
                    state.redis_init_failures += 1;
                    warn!(
                        failures = state.redis_init_failures,
                        "Redis cache initialised in fallback mode"
                    );
                } else {
                    state.redis_init_failures = 0;
                }
                Arc::new(store)
            }
            None => self.memory_store(),
        };

        state.requested = Some(requested);
        state.initializations += 1;
        state.last_init_at = Some(self.clock.now());
        state.cache = Some(Arc::clone(&cache));

        info!(
            requested = %requested,
            cache_type = %cache.current_cache_type(),
            "Cache initialised"
        );
        cache
    }

    fn memory_store(&self) -> Arc<dyn CacheStore> {
        Arc::new(MemoryCacheStore::with_clock(
            self.config.memory.clone(),
            Arc::clone(&self.clock),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::redis_store::FALLBACK_CACHE_TYPE;
    use crate::caching::CacheOptions;
    use serde_json::json;
    use std::time::Duration;

    fn unreachable_redis() -> RedisCacheConfig {
        RedisCacheConfig {
            url: "redis://127.0.0.1:1".to_string(),
            max_connection_attempts: 1,
            connection_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("Redis".parse::<CacheBackendKind>().unwrap(), CacheBackendKind::Redis);
        assert_eq!(" auto ".parse::<CacheBackendKind>().unwrap(), CacheBackendKind::Auto);
        assert!("memcached".parse::<CacheBackendKind>().is_err());
        assert_eq!(CacheBackendKind::default_for("development"), CacheBackendKind::Memory);
        assert_eq!(CacheBackendKind::default_for("production"), CacheBackendKind::Auto);
    }

    #[tokio::test]
    async fn test_none_before_init_then_memory() {
        let factory = CacheFactory::new(CacheFactoryConfig::default());
        assert_eq!(factory.current_cache_type().await, "none");
        assert!(factory.stats().await.last_init_at.is_none());

        let cache = factory.get_cache(None).await;
        assert_eq!(cache.current_cache_type(), "memory");

        let stats = factory.stats().await;
        assert_eq!(stats.cache_type, "memory");
        assert_eq!(stats.initializations, 1);
        assert!(stats.last_init_at.is_some());
    }

    #[tokio::test]
    async fn test_get_cache_reuses_instance() {
        let factory = CacheFactory::new(CacheFactoryConfig::default());
        let first = factory.get_cache(None).await;
        first.set("k", json!(1), CacheOptions::default()).await;

        let second = factory.get_cache(None).await;
        let forced_same = factory.get_cache(Some(CacheBackendKind::Memory)).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &forced_same));
        assert_eq!(factory.stats().await.initializations, 1);
    }

    #[tokio::test]
    async fn test_auto_without_url_is_memory() {
        let factory = CacheFactory::new(CacheFactoryConfig {
            backend: CacheBackendKind::Auto,
            ..Default::default()
        });
        assert_eq!(factory.get_cache(None).await.current_cache_type(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back_and_caps_attempts() {
        let factory = CacheFactory::new(CacheFactoryConfig {
            backend: CacheBackendKind::Redis,
            redis: Some(unreachable_redis()),
            max_redis_init_failures: 2,
            ..Default::default()
        });

        let cache = factory.get_cache(None).await;
        assert_eq!(cache.current_cache_type(), FALLBACK_CACHE_TYPE);
        assert!(cache.set("k", json!("v"), CacheOptions::default()).await);
        assert_eq!(cache.get("k").await, Some(json!("v")));

        // Forcing a different backend and back rebuilds; the second failure hits the cap.
        factory.get_cache(Some(CacheBackendKind::Memory)).await;
        factory.get_cache(Some(CacheBackendKind::Redis)).await;
        assert_eq!(factory.stats().await.redis_init_failures, 2);

        factory.get_cache(Some(CacheBackendKind::Memory)).await;
        let capped = factory.get_cache(Some(CacheBackendKind::Redis)).await;
        assert_eq!(capped.current_cache_type(), "memory");
        assert_eq!(factory.stats().await.redis_init_failures, 2);
    }

    #[tokio::test]
    async fn test_reset_rebuilds_and_clears_failures() {
        let factory = CacheFactory::new(CacheFactoryConfig {
            backend: CacheBackendKind::Redis,
            redis: Some(unreachable_redis()),
            ..Default::default()
        });
        factory.get_cache(None).await;
        assert_eq!(factory.stats().await.redis_init_failures, 1);

        let memory = factory.reset_cache(Some(CacheBackendKind::Memory)).await;
        assert_eq!(memory.current_cache_type(), "memory");
        assert_eq!(memory.get("anything").await, None);

        let stats = factory.stats().await;
        assert_eq!(stats.redis_init_failures, 0);
        assert_eq!(stats.requested_backend, Some(CacheBackendKind::Memory));
        assert_eq!(stats.initializations, 2);

        factory.shutdown().await;
        assert_eq!(factory.current_cache_type().await, "none");
    }
}
