//! Live key validation.
//!
//! A validator performs the cheapest authenticated call a provider offers and reports whether
//! the key was accepted. The outcome is informational; nothing in the vault changes because of it.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Result of validating a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// The provider accepted the key
    Valid,
    /// The provider rejected the key (401/403)
    Invalid,
    /// No active key of that type is stored
    Missing,
    /// No validation call is known for this key type
    Unsupported,
    /// The provider could not be asked (network failure, 5xx, rate limit)
    Unreachable,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Valid => "valid",
            KeyStatus::Invalid => "invalid",
            KeyStatus::Missing => "missing",
            KeyStatus::Unsupported => "unsupported",
            KeyStatus::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks a plaintext key against its provider
#[async_trait]
pub trait KeyValidator: Send + Sync + std::fmt::Debug {
    async fn validate(&self, key_type: &str, key: &str) -> KeyStatus;
}

/// Model used for the Anthropic probe message
const ANTHROPIC_PROBE_MODEL: &str = "claude-3-haiku-20240307";

/// Validates keys with minimal HTTP calls
#[derive(Debug, Clone)]
pub struct HttpKeyValidator {
    client: Client,
    endpoints: HashMap<String, String>,
}

impl HttpKeyValidator {
    /// Validator with the public provider endpoints
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client for key validation");
                Client::new()
            });

        let endpoints = [
            ("anthropic", "https://api.anthropic.com/v1"),
            ("openai", "https://api.openai.com/v1"),
            ("grok", "https://api.x.ai/v1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self { client, endpoints }
    }

    /// Point a key type at a different base URL
    pub fn with_endpoint(mut self, key_type: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.endpoints.insert(key_type.into(), base_url.into());
        self
    }

    async fn probe_anthropic(&self, base_url: &str, key: &str) -> Result<StatusCode, reqwest::Error> {
        let response = self
            .client
            .post(format!("{}/messages", base_url.trim_end_matches('/')))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": ANTHROPIC_PROBE_MODEL,
                "max_tokens": 10,
                "messages": [{"role": "user", "content": "API key validation test"}]
            }))
            .send()
            .await?;
        Ok(response.status())
    }

    async fn probe_bearer(&self, base_url: &str, key: &str) -> Result<StatusCode, reqwest::Error> {
        let response = self
            .client
            .get(format!("{}/models", base_url.trim_end_matches('/')))
            .bearer_auth(key)
            .send()
            .await?;
        Ok(response.status())
    }
}

impl Default for HttpKeyValidator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl KeyValidator for HttpKeyValidator {
    async fn validate(&self, key_type: &str, key: &str) -> KeyStatus {
        let Some(base_url) = self.endpoints.get(key_type) else {
            warn!(key_type, "No validation call known for key type");
            return KeyStatus::Unsupported;
        };

        let outcome = match key_type {
            "anthropic" => self.probe_anthropic(base_url, key).await,
            _ => self.probe_bearer(base_url, key).await,
        };

        let status = match outcome {
            Ok(code) if code.is_success() => KeyStatus::Valid,
            Ok(StatusCode::UNAUTHORIZED) | Ok(StatusCode::FORBIDDEN) => KeyStatus::Invalid,
            Ok(code) => {
                warn!(key_type, status = code.as_u16(), "Key validation inconclusive");
                KeyStatus::Unreachable
            }
            Err(e) => {
                warn!(key_type, error = %e, "Key validation request failed");
                KeyStatus::Unreachable
            }
        };

        info!(key_type, status = %status, "Key validated");
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_anthropic_probe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "bad"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let validator = HttpKeyValidator::default().with_endpoint("anthropic", format!("{}/v1", server.uri()));
        assert_eq!(validator.validate("anthropic", "good").await, KeyStatus::Valid);
        assert_eq!(validator.validate("anthropic", "bad").await, KeyStatus::Invalid);
    }

    #[tokio::test]
    async fn test_bearer_probe_and_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let validator = HttpKeyValidator::default().with_endpoint("grok", server.uri());
        assert_eq!(validator.validate("grok", "xai-key").await, KeyStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_unknown_type_is_unsupported() {
        let validator = HttpKeyValidator::default();
        assert_eq!(validator.validate("youtube", "yt").await, KeyStatus::Unsupported);
    }
}
