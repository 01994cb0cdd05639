//! # Core Types
//!
//! Request-side data structures shared by the optimizer, the cache key generator, the provider
//! client and the completion pipeline.

use crate::caching::CachePriority;
use crate::core::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default completion budget
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Hard ceiling for `max_tokens`
pub const MAX_TOKENS_CEILING: u32 = 4000;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Supported upstream providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Grok,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Grok,
        ProviderKind::Gemini,
    ];

    /// Stable lowercase name, also used as the vault key type
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Grok => "grok",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "grok" | "xai" => Ok(ProviderKind::Grok),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            other => Err(GatewayError::validation("provider", format!("unknown provider '{}'", other))),
        }
    }
}

/// Whether a completion may be served from and stored into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Bypass the response cache entirely
    None,
    #[default]
    Standard,
}

/// A provider-agnostic completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub provider: ProviderKind,
    pub messages: Vec<Message>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Overrides the provider's configured default model
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub cache_policy: CachePolicy,

    /// Eviction priority of the cached response
    #[serde(default)]
    pub priority: CachePriority,

    #[serde(default)]
    pub skip_optimization: bool,
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl CompletionRequest {
    pub fn new(provider: ProviderKind, messages: Vec<Message>) -> Self {
        Self {
            provider,
            messages,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            model: None,
            cache_policy: CachePolicy::Standard,
            priority: CachePriority::Normal,
            skip_optimization: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Check the request before anything touches a provider.
    ///
    /// `max_tokens` above the ceiling is clamped rather than rejected; a zero budget is an error.
    pub fn validate(mut self) -> GatewayResult<Self> {
        if self.messages.is_empty() {
            return Err(GatewayError::validation("messages", "at least one message is required"));
        }

        for (index, message) in self.messages.iter().enumerate() {
            if message.content.trim().is_empty() {
                return Err(GatewayError::validation(
                    format!("messages[{}].content", index),
                    "content must not be empty",
                ));
            }
        }

        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(GatewayError::validation(
                "temperature",
                format!("must be between 0 and 2, got {}", self.temperature),
            ));
        }

        if self.max_tokens == 0 {
            return Err(GatewayError::validation("max_tokens", "must be greater than 0"));
        }
        self.max_tokens = self.max_tokens.min(MAX_TOKENS_CEILING);

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_blank_content() {
        let request = CompletionRequest::new(
            ProviderKind::OpenAi,
            vec![Message::user("hello"), Message::assistant("   ")],
        );
        match request.validate() {
            Err(GatewayError::Validation { field, .. }) => assert_eq!(field, "messages[1].content"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_clamps_max_tokens() {
        let request = CompletionRequest::new(ProviderKind::Grok, vec![Message::user("hi")])
            .with_max_tokens(10_000)
            .validate()
            .unwrap();
        assert_eq!(request.max_tokens, MAX_TOKENS_CEILING);
        assert_eq!(request.temperature, DEFAULT_TEMPERATURE);
    }

    #[test]
    fn test_validate_temperature_range() {
        let request = CompletionRequest::new(ProviderKind::Gemini, vec![Message::user("hi")])
            .with_temperature(2.5);
        assert!(matches!(request.validate(), Err(GatewayError::Validation { .. })));
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("Claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("xai".parse::<ProviderKind>().unwrap(), ProviderKind::Grok);
        assert!("mistral".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: CompletionRequest = serde_json::from_str(
            r#"{"provider":"openai","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(request.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(request.cache_policy, CachePolicy::Standard);
        assert_eq!(request.priority, CachePriority::Normal);
    }
}
