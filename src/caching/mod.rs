//! # Caching System Module
//!
//! Response caching for provider completions. Two interchangeable backends implement the
//! [`CacheStore`] contract:
//!
//! - [`MemoryCacheStore`]: in-process, TTL bound and size bound with importance weighted eviction
//! - [`RedisCacheStore`]: network backed, permanently degrading to an embedded memory store when
//!   Redis misbehaves
//!
//! [`CacheFactory`] picks the backend from configuration and runtime health. The
//! [`RequestDeduplicator`] collapses concurrent identical provider calls, and
//! [`CacheKeyGenerator`] derives the fingerprint both of them key on.
//!
//! ## Usage Example
//! ```rust,no_run
//! use ai_gateway::caching::{CacheOptions, CacheStore, MemoryCacheStore, MemoryCacheConfig};
//! use serde_json::json;
//!
//! # async fn demo() {
//! let cache = MemoryCacheStore::new(MemoryCacheConfig::default());
//! cache.set("q1", json!({"x": 1}), CacheOptions::default()).await;
//! assert_eq!(cache.get("q1").await, Some(json!({"x": 1})));
//! # }
//! ```

pub mod deduplication;
pub mod factory;
pub mod key_generator;
pub mod stores;

pub use deduplication::{DeduplicationConfig, DeduplicationStats, RequestDeduplicator};
pub use factory::{CacheBackendKind, CacheFactory, CacheFactoryConfig, CacheFactoryStats};
pub use key_generator::{CacheKeyGenerator, KeyGeneratorConfig};
pub use stores::{
    CacheEntry, CacheOptions, CachePriority, CacheStats, CacheStore, CacheStoreExt, MemoryCacheConfig,
    MemoryCacheStore, RedisCacheConfig, RedisCacheStore,
};

use crate::core::error::GatewayError;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
///
/// These never leave the stores: they are logged and answered with a degraded result.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache operation timeout")]
    Timeout,

    #[error("Cache not available")]
    Unavailable,
}

impl From<CacheError> for GatewayError {
    fn from(err: CacheError) -> Self {
        GatewayError::cache_backend(err.to_string())
    }
}
