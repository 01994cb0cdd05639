//! # Configuration Module
//!
//! Configuration for every gateway component, loaded from an optional YAML file and then
//! overridden by `GATEWAY_*` environment variables.
//!
//! ## Key Features
//! - YAML parsing with serde; every section and field has a safe default
//! - Durations written the humantime way (`30s`, `5m`, `1h`)
//! - Environment variable overrides for the settings operators change most
//! - Validation that reports every problem at once

use crate::caching::factory::{CacheBackendKind, CacheFactoryConfig};
use crate::caching::{DeduplicationConfig, MemoryCacheConfig, RedisCacheConfig};
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::service::CompletionSettings;
use crate::optimizer::OptimizerOptions;
use crate::providers::ProvidersConfig;
use crate::vault::{VaultConfig, DEFAULT_ENCRYPTION_KEY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Main gateway configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Deployment environment (`development`, `staging`, `production`, ...)
    pub environment: String,

    /// Response cache settings
    pub cache: CacheSettings,

    /// Per-provider circuit breaker settings
    pub breaker: CircuitBreakerConfig,

    /// In-flight request deduplication
    pub dedup: DeduplicationConfig,

    /// Outbound payload shaping
    pub optimizer: OptimizerOptions,

    /// Credential vault
    pub vault: VaultConfig,

    /// Provider endpoints, models and timeouts
    pub providers: ProvidersConfig,

    /// Completion pipeline behaviour
    pub completion: CompletionSettings,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            cache: CacheSettings::default(),
            breaker: CircuitBreakerConfig::default(),
            dedup: DeduplicationConfig::default(),
            optimizer: OptimizerOptions::default(),
            vault: VaultConfig::default(),
            providers: ProvidersConfig::default(),
            completion: CompletionSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Cache section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// `memory`, `redis` or `auto`; unset picks by environment
    #[serde(rename = "type")]
    pub backend: Option<CacheBackendKind>,

    /// Redis connection string; enables Redis for `auto`
    pub redis_url: Option<String>,

    /// In-memory store settings
    pub memory: MemoryCacheConfig,

    /// Redis store settings (the URL comes from `redis_url`)
    pub redis: RedisCacheConfig,

    /// Lifetime of cached completions
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Failed Redis initialisations tolerated before sticking to memory
    pub max_redis_init_failures: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: None,
            redis_url: None,
            memory: MemoryCacheConfig::default(),
            redis: RedisCacheConfig::default(),
            ttl: Duration::from_secs(3600),
            max_redis_init_failures: 3,
        }
    }
}

impl CacheSettings {
    /// Factory configuration for the given environment
    pub fn factory_config(&self, environment: &str) -> CacheFactoryConfig {
        let redis = self.redis_url.as_ref().map(|url| RedisCacheConfig {
            url: url.clone(),
            fallback: self.memory.clone(),
            ..self.redis.clone()
        });

        CacheFactoryConfig {
            backend: self
                .backend
                .unwrap_or_else(|| CacheBackendKind::default_for(environment)),
            memory: self.memory.clone(),
            redis,
            max_redis_init_failures: self.max_redis_init_failures,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or full `EnvFilter` directive
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, then apply environment overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> GatewayResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise from the environment only
    pub async fn load(path: Option<&Path>) -> GatewayResult<Self> {
        match path {
            Some(path) => Self::load_from_file(path).await,
            None => Self::from_env(),
        }
    }

    /// Parse YAML without overrides or validation
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content).map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_CACHE_MAX_ITEMS=5000
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_env_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup` instead of the process environment
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("GATEWAY_ENV") {
            self.environment = env;
        }

        // Cache overrides
        if let Some(kind) = lookup("GATEWAY_CACHE_TYPE") {
            self.cache.backend = Some(kind.parse()?);
        }

        if let Some(max) = lookup("GATEWAY_CACHE_MAX_ITEMS") {
            self.cache.memory.max_items = parse_number("GATEWAY_CACHE_MAX_ITEMS", &max)?;
        }

        if let Some(interval) = lookup("GATEWAY_CACHE_CLEANUP_INTERVAL") {
            self.cache.memory.cleanup_interval = parse_duration("GATEWAY_CACHE_CLEANUP_INTERVAL", &interval)?;
        }

        if let Some(ttl) = lookup("GATEWAY_CACHE_TTL") {
            self.cache.ttl = parse_duration("GATEWAY_CACHE_TTL", &ttl)?;
        }

        if let Some(url) = lookup("GATEWAY_REDIS_URL") {
            self.cache.redis_url = (!url.trim().is_empty()).then_some(url);
        }

        // Breaker overrides
        if let Some(threshold) = lookup("GATEWAY_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = parse_number("GATEWAY_BREAKER_FAILURE_THRESHOLD", &threshold)?;
        }

        if let Some(timeout) = lookup("GATEWAY_BREAKER_RESET_TIMEOUT") {
            self.breaker.reset_timeout = parse_duration("GATEWAY_BREAKER_RESET_TIMEOUT", &timeout)?;
        }

        // Optimizer overrides
        if let Some(max) = lookup("GATEWAY_MAX_CONTENT_LENGTH") {
            self.optimizer.max_content_length = parse_number("GATEWAY_MAX_CONTENT_LENGTH", &max)?;
        }

        // Vault overrides
        if let Some(key) = lookup("GATEWAY_ENCRYPTION_KEY") {
            self.vault.encryption_key = key;
        }

        if let Some(path) = lookup("GATEWAY_KEY_FILE") {
            self.vault.key_file = Some(PathBuf::from(path));
        }

        // Logging configuration overrides
        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.environment.trim().is_empty() {
            errors.push("environment cannot be empty".to_string());
        }

        // Cache
        if self.cache.memory.max_items == 0 {
            errors.push("cache.memory.max_items must be greater than 0".to_string());
        }

        if !(self.cache.memory.eviction_ratio > 0.0 && self.cache.memory.eviction_ratio <= 1.0) {
            errors.push(format!(
                "cache.memory.eviction_ratio must be in (0, 1], got: {}",
                self.cache.memory.eviction_ratio
            ));
        }

        if self.cache.memory.cleanup_interval.is_zero() {
            errors.push("cache.memory.cleanup_interval must be greater than 0".to_string());
        }

        if self.cache.ttl.is_zero() {
            errors.push("cache.ttl must be greater than 0".to_string());
        }

        if let Some(url) = &self.cache.redis_url {
            match Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") => {}
                Ok(parsed) => errors.push(format!("cache.redis_url has unsupported scheme '{}'", parsed.scheme())),
                Err(e) => errors.push(format!("cache.redis_url is invalid: {}", e)),
            }
        }

        if self.cache.backend == Some(CacheBackendKind::Redis) && self.cache.redis_url.is_none() {
            warn!("Cache type is redis but no redis_url is set, using the default local address");
        }

        // Breaker
        if self.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be greater than 0".to_string());
        }

        if self.breaker.success_threshold == Some(0) {
            errors.push("breaker.success_threshold must be greater than 0".to_string());
        }

        if self.breaker.reset_timeout.is_zero() {
            errors.push("breaker.reset_timeout must be greater than 0".to_string());
        }

        if self.breaker.monitor_interval.is_zero() {
            errors.push("breaker.monitor_interval must be greater than 0".to_string());
        }

        if self.breaker.backoff.base > self.breaker.backoff.max {
            errors.push("breaker.backoff.base must not exceed breaker.backoff.max".to_string());
        }

        // Dedup
        if self.dedup.max_pool_size == 0 {
            errors.push("dedup.max_pool_size must be greater than 0".to_string());
        }

        // Optimizer
        if self.optimizer.max_content_length <= 100 {
            errors.push(format!(
                "optimizer.max_content_length must be greater than 100, got: {}",
                self.optimizer.max_content_length
            ));
        }

        if self.optimizer.summarize_threshold <= self.optimizer.keep_recent + 1 {
            errors.push("optimizer.summarize_threshold must exceed optimizer.keep_recent + 1".to_string());
        }

        // Vault
        if self.vault.encryption_key.is_empty() {
            errors.push("vault.encryption_key cannot be empty".to_string());
        } else if self.vault.encryption_key == DEFAULT_ENCRYPTION_KEY && !self.is_development() {
            warn!(
                environment = %self.environment,
                "Vault is using the default encryption key, set GATEWAY_ENCRYPTION_KEY"
            );
        }

        if self.vault.cleanup_interval.is_zero() {
            errors.push("vault.cleanup_interval must be greater than 0".to_string());
        }

        // Providers
        for (kind, settings) in self.providers.iter() {
            if let Err(e) = Url::parse(&settings.base_url) {
                errors.push(format!("providers.{}.base_url is invalid: {}", kind, e));
            }
            if settings.model.trim().is_empty() {
                errors.push(format!("providers.{}.model cannot be empty", kind));
            }
            if settings.timeout.is_zero() {
                errors.push(format!("providers.{}.timeout must be greater than 0", kind));
            }
        }

        // Completion
        if self.completion.max_attempts == 0 {
            errors.push("completion.max_attempts must be greater than 0".to_string());
        }

        // Logging
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            level if level.contains('=') => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!("Invalid log format: {}", self.logging.format)),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

fn parse_number<T>(name: &str, value: &str) -> GatewayResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid {}: {}", name, e)))
}

fn parse_duration(name: &str, value: &str) -> GatewayResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| GatewayError::config(format!("Invalid {}: {}", name, e)))
}
