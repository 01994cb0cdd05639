//! # Completion Pipeline
//!
//! [`CompletionGateway::complete`] runs one provider-agnostic request through the full chain:
//!
//! 1. validate the request
//! 2. derive the cache key and consult the response cache
//! 3. on a miss, shrink the payload with the [`PayloadOptimizer`]
//! 4. fetch the provider credential from the vault
//! 5. join or start the deduplicated upstream call
//! 6. run it through the provider's circuit breaker, degrading to a smaller payload and the
//!    provider's fast model after a timeout
//! 7. store the result with TTL and tags

use crate::caching::{CacheFactory, CacheKeyGenerator, CacheOptions, CacheStoreExt, RequestDeduplicator};
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::retry::RetryPolicy;
use crate::core::types::{CachePolicy, CompletionRequest, ProviderKind};
use crate::observability::metrics::{CACHE_HITS, CACHE_MISSES};
use crate::optimizer::{simplify_messages, PayloadOptimizer};
use crate::providers::{CompletionBackend, CompletionResponse, ProviderCall, ProviderSettings, ProvidersConfig};
use crate::vault::CredentialVault;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tag attached to every cached completion
pub const COMPLETION_TAG: &str = "completion";

/// Completion pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    /// Attempts per request including the degraded retry after a timeout
    pub max_attempts: u32,

    /// Per-message character budget of the degraded retry
    pub simplified_max_length: usize,

    /// Completion budget of the degraded retry
    pub simplified_max_tokens: u32,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            simplified_max_length: 500,
            simplified_max_tokens: 512,
        }
    }
}

/// Provider-agnostic completion service
pub struct CompletionGateway {
    cache: Arc<CacheFactory>,
    breakers: Arc<CircuitBreakerRegistry>,
    vault: Arc<CredentialVault>,
    backend: Arc<dyn CompletionBackend>,
    dedup: RequestDeduplicator<CompletionResponse>,
    optimizer: PayloadOptimizer,
    keys: CacheKeyGenerator,
    providers: ProvidersConfig,
    settings: CompletionSettings,
    response_ttl: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for CompletionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionGateway")
            .field("settings", &self.settings)
            .field("in_flight", &self.dedup.in_flight())
            .finish()
    }
}

impl CompletionGateway {
    pub fn new(
        config: &GatewayConfig,
        cache: Arc<CacheFactory>,
        breakers: Arc<CircuitBreakerRegistry>,
        vault: Arc<CredentialVault>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            cache,
            breakers,
            vault,
            backend,
            dedup: RequestDeduplicator::new(config.dedup.clone()),
            optimizer: PayloadOptimizer::new(config.optimizer.clone()),
            keys: CacheKeyGenerator::default(),
            providers: config.providers.clone(),
            settings: config.completion.clone(),
            response_ttl: config.cache.ttl,
            closed: AtomicBool::new(false),
        }
    }

    /// Answer `request`, from the cache when possible
    pub async fn complete(&self, request: CompletionRequest) -> GatewayResult<CompletionResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::internal("completion gateway is shut down"));
        }

        let request = request.validate()?;
        let provider = request.provider;
        let settings = self.providers.settings(provider);
        let model = request.model.clone().unwrap_or_else(|| settings.model.clone());
        let key = self.cache_key(&request);

        let cache = self.cache.get_cache(None).await;
        let use_cache = request.cache_policy == CachePolicy::Standard;

        if use_cache {
            if let Some(mut hit) = cache.get_json::<CompletionResponse>(&key).await {
                metrics::counter!(CACHE_HITS, "provider" => provider.as_str()).increment(1);
                debug!(provider = %provider, key = %key, "Completion served from cache");
                hit.cached = true;
                return Ok(hit);
            }
            metrics::counter!(CACHE_MISSES, "provider" => provider.as_str()).increment(1);
        }

        let messages = if request.skip_optimization {
            request.messages.clone()
        } else {
            self.optimizer.optimize_messages(&request.messages)
        };

        let api_key = self
            .credential(provider)
            .await
            .ok_or_else(|| GatewayError::MissingCredential {
                provider: provider.to_string(),
            })?;

        let call = ProviderCall {
            provider,
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            timeout: settings.timeout,
            api_key,
        };

        let breaker = self.breakers.get(provider.as_str());
        let backend = Arc::clone(&self.backend);
        let policy = self.degrade_policy(&settings);
        let store = use_cache.then(|| Arc::clone(&cache));
        let options = CacheOptions::with_ttl(self.response_ttl)
            .tags([provider.as_str(), COMPLETION_TAG])
            .priority(request.priority);
        let store_key = key.clone();

        self.dedup
            .dedupe(&key, move || async move {
                let response = policy
                    .run(call, move |attempt: ProviderCall| {
                        let breaker = Arc::clone(&breaker);
                        let backend = Arc::clone(&backend);
                        async move {
                            breaker
                                .execute(|| {
                                    let backend = Arc::clone(&backend);
                                    let attempt = attempt.clone();
                                    async move { backend.complete(attempt).await }
                                })
                                .await
                        }
                    })
                    .await?;

                if let Some(cache) = store {
                    if !cache.set_json(&store_key, &response, options).await {
                        warn!(key = %store_key, "Failed to cache completion");
                    }
                }
                Ok(response)
            })
            .await
    }

    /// Cache key of `request`; a model override is part of the key
    pub fn cache_key(&self, request: &CompletionRequest) -> String {
        let key = self
            .keys
            .cache_key(request.provider, &request.messages, request.temperature);
        match &request.model {
            Some(model) => format!("{}:{}", key, model),
            None => key,
        }
    }

    /// Drop every cached completion of `provider`
    pub async fn invalidate_provider(&self, provider: ProviderKind) -> usize {
        let cache = self.cache.get_cache(None).await;
        let removed = cache.invalidate_tag(provider.as_str()).await;
        info!(provider = %provider, removed, "Cached completions invalidated");
        removed
    }

    /// Number of upstream calls currently shared by the deduplicator
    pub fn in_flight(&self) -> usize {
        self.dedup.in_flight()
    }

    pub fn deduplicator(&self) -> &RequestDeduplicator<CompletionResponse> {
        &self.dedup
    }

    /// Reject new requests and fail the in-flight ones
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        self.dedup.cancel_all()
    }

    async fn credential(&self, provider: ProviderKind) -> Option<String> {
        if let Some(key) = self.vault.get_key(provider.as_str()).await {
            return Some(key);
        }
        match provider {
            ProviderKind::Gemini => self.vault.get_key("google").await,
            _ => None,
        }
    }

    /// Retry once on timeout with the fast model and an aggressively shrunk payload
    fn degrade_policy(&self, settings: &ProviderSettings) -> RetryPolicy<ProviderCall> {
        let fast_model = settings.fast_model.clone();
        let fast_timeout = settings.fast_timeout;
        let max_length = self.settings.simplified_max_length;
        let max_tokens = self.settings.simplified_max_tokens;
        let simplifier = PayloadOptimizer::simplified(max_length);

        RetryPolicy::new(self.settings.max_attempts, |e| matches!(e, GatewayError::Timeout { .. })).with_transform(
            move |attempt, call: &ProviderCall| {
                info!(
                    provider = %call.provider,
                    attempt,
                    model = %fast_model,
                    "Provider timed out, retrying with simplified payload"
                );
                ProviderCall {
                    model: fast_model.clone(),
                    messages: simplify_messages(&simplifier.optimize_messages(&call.messages), max_length),
                    max_tokens: call.max_tokens.min(max_tokens),
                    timeout: fast_timeout,
                    ..call.clone()
                }
            },
        )
    }
}
