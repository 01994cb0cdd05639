//! Provider HTTP client

use super::types::{AnthropicRequest, ChatCompletionRequest, CompletionResponse, GenerateContentRequest, ProviderResponse};
use super::ProvidersConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Message, ProviderKind};
use crate::observability::metrics::UPSTREAM_REQUESTS;
use crate::observability::redact_secrets;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest upstream error text carried into an error
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// One fully resolved provider call
#[derive(Clone)]
pub struct ProviderCall {
    pub provider: ProviderKind,
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub api_key: String,
}

impl std::fmt::Debug for ProviderCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCall")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Something that can answer a provider call
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, call: ProviderCall) -> GatewayResult<CompletionResponse>;
}

/// Maps an unsuccessful provider status onto the gateway error taxonomy
pub trait ErrorClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, provider: ProviderKind, status: u16, retry_after: Option<Duration>, body: &str) -> GatewayError;
}

/// 429 is a rate limit, 408 and 5xx are transient, every other status is terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorClassifier;

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, provider: ProviderKind, status: u16, retry_after: Option<Duration>, body: &str) -> GatewayError {
        let message = serde_json::from_str::<ApiError>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());
        let message: String = redact_secrets(&message).chars().take(MAX_ERROR_MESSAGE_CHARS).collect();

        match status {
            429 => GatewayError::RateLimited {
                provider: provider.to_string(),
                retry_after,
            },
            408 | 500..=599 => GatewayError::transient(provider.as_str(), message, Some(status)),
            _ => GatewayError::upstream(provider.as_str(), status, message),
        }
    }
}

/// Parse `Retry-After` as delta seconds or an HTTP date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok()
}

/// HTTP client for every supported provider
pub struct ProviderClient {
    http: Client,
    config: ProvidersConfig,
    classifier: Arc<dyn ErrorClassifier>,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("config", &self.config)
            .field("classifier", &self.classifier)
            .finish()
    }
}

impl ProviderClient {
    pub fn new(config: ProvidersConfig) -> GatewayResult<Self> {
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            classifier: Arc::new(DefaultErrorClassifier),
        })
    }

    /// Replace the status classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &ProvidersConfig {
        &self.config
    }

    fn build_request(&self, call: &ProviderCall) -> RequestBuilder {
        let settings = self.config.settings(call.provider);
        let base_url = settings.base_url.trim_end_matches('/');

        let request = match call.provider {
            ProviderKind::OpenAi | ProviderKind::Grok => self
                .http
                .post(format!("{}/chat/completions", base_url))
                .bearer_auth(&call.api_key)
                .json(&ChatCompletionRequest {
                    model: &call.model,
                    messages: &call.messages,
                    temperature: call.temperature,
                    max_tokens: call.max_tokens,
                    stream: false,
                }),
            ProviderKind::Anthropic => self
                .http
                .post(format!("{}/messages", base_url))
                .header("x-api-key", &call.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&AnthropicRequest::new(
                    &call.model,
                    &call.messages,
                    call.max_tokens,
                    call.temperature,
                )),
            ProviderKind::Gemini => self
                .http
                .post(format!("{}/models/{}:generateContent", base_url, call.model))
                .query(&[("key", call.api_key.as_str())])
                .json(&GenerateContentRequest::new(
                    &call.messages,
                    call.max_tokens,
                    call.temperature,
                )),
        };

        request.timeout(call.timeout)
    }

    async fn send(&self, call: &ProviderCall) -> GatewayResult<CompletionResponse> {
        let response = self.build_request(call).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    timeout_ms: call.timeout.as_millis() as u64,
                }
            } else {
                GatewayError::transient(call.provider.as_str(), redact_secrets(&e.to_string()), None)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(self
                .classifier
                .classify(call.provider, status.as_u16(), retry_after, &body));
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    timeout_ms: call.timeout.as_millis() as u64,
                }
            } else {
                GatewayError::transient(call.provider.as_str(), redact_secrets(&e.to_string()), None)
            }
        })?;

        Ok(ProviderResponse::parse(call.provider, &body)?.into_completion(call.provider, &call.model))
    }
}

#[async_trait]
impl CompletionBackend for ProviderClient {
    async fn complete(&self, call: ProviderCall) -> GatewayResult<CompletionResponse> {
        let started = Instant::now();
        let result = self.send(&call).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.error_type(),
        };
        metrics::counter!(
            UPSTREAM_REQUESTS,
            "provider" => call.provider.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        match &result {
            Ok(response) => debug!(
                provider = %call.provider,
                model = %response.model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                total_tokens = response.usage.total_tokens,
                "Provider call succeeded"
            ),
            Err(e) => warn!(
                provider = %call.provider,
                model = %call.model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "Provider call failed"
            ),
        }

        result
    }
}
