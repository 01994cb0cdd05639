//! Gateway lifecycle.
//!
//! [`GatewayContext::init`] builds every component in dependency order and
//! [`GatewayContext::shutdown`] stops their background work in reverse.

use crate::caching::{CacheFactory, CacheFactoryStats, CacheStore, DeduplicationStats};
use crate::core::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::core::clock::{system_clock, SharedClock};
use crate::core::config::GatewayConfig;
use crate::core::error::GatewayResult;
use crate::core::types::ProviderKind;
use crate::gateway::service::CompletionGateway;
use crate::observability::describe_metrics;
use crate::providers::{CompletionBackend, ProviderClient};
use crate::vault::{
    CredentialVault, HttpKeyValidator, InMemoryKeyStore, JsonFileKeyStore, KeyStore, KeyValidator, VaultStats,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const KEY_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of every component, for logs and diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub environment: String,
    pub cache: CacheFactoryStats,
    pub breakers: Vec<CircuitBreakerStats>,
    pub vault: VaultStats,
    pub dedup: DeduplicationStats,
}

/// Every long-lived gateway component
#[derive(Debug)]
pub struct GatewayContext {
    config: GatewayConfig,
    cache: Arc<CacheFactory>,
    breakers: Arc<CircuitBreakerRegistry>,
    vault: Arc<CredentialVault>,
    gateway: Arc<CompletionGateway>,
}

/// Swaps the clock, upstream backend or key storage used by [`GatewayContext`]
#[derive(Default)]
pub struct GatewayContextBuilder {
    clock: Option<SharedClock>,
    backend: Option<Arc<dyn CompletionBackend>>,
    key_store: Option<Arc<dyn KeyStore>>,
    validator: Option<Arc<dyn KeyValidator>>,
}

impl GatewayContextBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn key_store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(store);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn KeyValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Validate `config` and start every component
    pub async fn init(self, config: GatewayConfig) -> GatewayResult<GatewayContext> {
        config.validate()?;
        describe_metrics();

        let clock = self.clock.unwrap_or_else(system_clock);

        let cache = Arc::new(CacheFactory::with_clock(
            config.cache.factory_config(&config.environment),
            Arc::clone(&clock),
        ));
        let store = cache.get_cache(None).await;

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone(), true));
        for kind in ProviderKind::ALL {
            breakers.get(kind.as_str());
        }

        let key_store = match self.key_store {
            Some(store) => store,
            None => match &config.vault.key_file {
                Some(path) => Arc::new(JsonFileKeyStore::new(path.clone())) as Arc<dyn KeyStore>,
                None => Arc::new(InMemoryKeyStore::new()),
            },
        };
        let validator = match self.validator {
            Some(validator) => validator,
            None => Arc::new(default_validator(&config)),
        };
        let vault = Arc::new(
            CredentialVault::open(config.vault.clone(), key_store, Arc::clone(&clock))
                .await?
                .with_validator(validator),
        );
        vault.start_cleanup();

        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(ProviderClient::new(config.providers.clone())?),
        };

        let gateway = Arc::new(CompletionGateway::new(
            &config,
            Arc::clone(&cache),
            Arc::clone(&breakers),
            Arc::clone(&vault),
            backend,
        ));

        info!(
            environment = %config.environment,
            cache = %store.current_cache_type(),
            keys = vault.stats().active_keys,
            "Gateway initialized"
        );

        Ok(GatewayContext {
            config,
            cache,
            breakers,
            vault,
            gateway,
        })
    }
}

fn default_validator(config: &GatewayConfig) -> HttpKeyValidator {
    [ProviderKind::Anthropic, ProviderKind::OpenAi, ProviderKind::Grok]
        .into_iter()
        .fold(HttpKeyValidator::new(KEY_VALIDATION_TIMEOUT), |validator, kind| {
            validator.with_endpoint(kind.as_str(), config.providers.settings(kind).base_url)
        })
}

impl GatewayContext {
    pub fn builder() -> GatewayContextBuilder {
        GatewayContextBuilder::default()
    }

    /// Start the gateway with the real clock, provider client and configured key file
    pub async fn init(config: GatewayConfig) -> GatewayResult<Self> {
        Self::builder().init(config).await
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<CompletionGateway> {
        &self.gateway
    }

    pub fn cache_factory(&self) -> &Arc<CacheFactory> {
        &self.cache
    }

    pub async fn cache(&self) -> Arc<dyn CacheStore> {
        self.cache.get_cache(None).await
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            environment: self.config.environment.clone(),
            cache: self.cache.stats().await,
            breakers: self.breakers.stats(),
            vault: self.vault.stats(),
            dedup: self.gateway.deduplicator().stats(),
        }
    }

    /// Fail in-flight requests and stop every background task
    pub async fn shutdown(&self) {
        let cancelled = self.gateway.close();
        self.breakers.shutdown_all().await;
        self.vault.shutdown().await;
        self.cache.shutdown().await;
        info!(cancelled, "Gateway shut down");
    }
}
