//! # Cache Stores Module
//!
//! The [`CacheStore`] contract and the types shared by its implementations.

pub mod memory;
pub mod redis_store;

pub use memory::{MemoryCacheConfig, MemoryCacheStore};
pub use redis_store::{RedisCacheConfig, RedisCacheStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::core::clock::add_duration;

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Eviction priority of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl CachePriority {
    /// Weight used by the eviction score
    pub fn weight(&self) -> f64 {
        match self {
            CachePriority::Low => 1.0,
            CachePriority::Normal => 2.0,
            CachePriority::High => 3.0,
        }
    }
}

/// Per-write options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Time to live
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Tags for group invalidation
    pub tags: Vec<String>,

    /// Eviction priority
    pub priority: CachePriority,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            tags: Vec::new(),
            priority: CachePriority::Normal,
        }
    }
}

impl CacheOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Cache entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,

    /// The cached value
    pub value: Value,

    pub created_at: DateTime<Utc>,

    /// Entry is gone once `now >= expires_at`
    pub expires_at: DateTime<Utc>,

    /// Number of reads served from this entry
    pub hit_count: u64,

    pub last_accessed_at: DateTime<Utc>,

    pub priority: CachePriority,

    pub tags: Vec<String>,
}

impl CacheEntry {
    /// Create a new cache entry. A zero TTL is bumped to one millisecond so that
    /// `expires_at > created_at` always holds.
    pub fn new(key: impl Into<String>, value: Value, options: &CacheOptions, now: DateTime<Utc>) -> Self {
        let ttl = options.ttl.max(Duration::from_millis(1));
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: add_duration(now, ttl),
            hit_count: 0,
            last_accessed_at: now,
            priority: options.priority,
            tags: options.tags.clone(),
        }
    }

    /// Check if the entry is expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Mark the entry as accessed
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.hit_count += 1;
        self.last_accessed_at = now;
    }

    /// Remaining lifetime in hours (0 when expired)
    pub fn remaining_hours(&self, now: DateTime<Utc>) -> f64 {
        let remaining_ms = (self.expires_at - now).num_milliseconds().max(0);
        remaining_ms as f64 / 3_600_000.0
    }

    /// Importance score; lower scores are evicted first.
    ///
    /// Only the ordering matters: higher priority, more hits and more remaining lifetime all
    /// raise the score. The hit factor is strictly positive so priority still ranks cold entries.
    pub fn importance(&self, now: DateTime<Utc>) -> f64 {
        let hit_factor = ((self.hit_count + 2) as f64).ln();
        self.priority.weight() * hit_factor * (self.remaining_hours(now) + 1.0)
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Backend description, e.g. `memory`, `redis`, `memory (fallback)`
    #[serde(rename = "type")]
    pub cache_type: String,

    pub size: usize,
    pub hits: u64,
    pub misses: u64,

    /// hits / (hits + misses), rounded to two decimals
    pub hit_rate: f64,

    pub avg_access_time_ms: f64,
}

impl CacheStats {
    pub fn compute(cache_type: impl Into<String>, size: usize, hits: u64, misses: u64, total_access_micros: u64, accesses: u64) -> Self {
        let lookups = hits + misses;
        let hit_rate = if lookups > 0 {
            round2(hits as f64 / lookups as f64)
        } else {
            0.0
        };
        let avg_access_time_ms = if accesses > 0 {
            round2(total_access_micros as f64 / accesses as f64 / 1000.0)
        } else {
            0.0
        };

        Self {
            cache_type: cache_type.into(),
            size,
            hits,
            misses,
            hit_rate,
            avg_access_time_ms,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Trait for cache store implementations
///
/// Backend failures are absorbed by the implementation: reads degrade to misses and writes
/// report `false`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a value from the cache
    async fn get(&self, key: &str) -> Option<Value>;

    /// Store a value; returns whether the write was accepted
    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> bool;

    /// Delete a value; returns whether something was removed
    async fn del(&self, key: &str) -> bool;

    /// Keys matching a Redis-style glob (`*`, `?`, `[...]`)
    async fn keys(&self, pattern: &str) -> Vec<String>;

    /// Keys carrying `tag`
    async fn keys_by_tag(&self, tag: &str) -> Vec<String>;

    /// Delete every key carrying `tag`; returns the number of deleted keys
    async fn invalidate_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        for key in self.keys_by_tag(tag).await {
            if self.del(&key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every entry
    async fn flush_all(&self) -> bool;

    /// Get cache statistics
    async fn stats(&self) -> CacheStats;

    /// Human readable backend type
    fn current_cache_type(&self) -> String;

    /// Stop background work owned by the store
    async fn shutdown(&self);
}

/// Typed helpers over [`CacheStore`]
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value has an unexpected shape, ignoring it");
                None
            }
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T, options: CacheOptions) -> bool {
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, json, options).await,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache value");
                false
            }
        }
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}

/// Compile a Redis-style glob into an anchored regex.
///
/// Supports `*`, `?`, character classes (`[abc]`, `[^a]`, `[!a]`, ranges) and `\` escapes.
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            '[' => {
                let mut class = String::from("[");
                if matches!(chars.peek(), Some('^') | Some('!')) {
                    chars.next();
                    class.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    match inner {
                        '\\' | '[' | '&' | '~' => {
                            class.push('\\');
                            class.push(inner);
                        }
                        _ => class.push(inner),
                    }
                }
                if !closed {
                    return None;
                }
                class.push(']');
                out.push_str(&class);
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Regex::new(&out).ok()
}

/// Glob matcher with a literal fallback for malformed patterns
pub(crate) struct KeyMatcher {
    regex: Option<Regex>,
    literal: String,
}

impl KeyMatcher {
    pub(crate) fn new(pattern: &str) -> Self {
        Self {
            regex: glob_to_regex(pattern),
            literal: pattern.to_string(),
        }
    }

    pub(crate) fn matches(&self, key: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(key),
            None => key == self.literal,
        }
    }
}
