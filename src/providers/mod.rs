//! # Provider Module
//!
//! HTTP access to the upstream generative-AI APIs.
//!
//! [`ProviderClient`] turns a provider-agnostic [`ProviderCall`] into the request shape each
//! provider expects, validates the answer into a [`ProviderResponse`] and maps failures onto the
//! gateway error taxonomy through an [`ErrorClassifier`].

pub mod client;
pub mod types;

pub use client::{CompletionBackend, DefaultErrorClassifier, ErrorClassifier, ProviderCall, ProviderClient};
pub use types::{CompletionResponse, ProviderResponse, TokenUsage};

use crate::core::types::ProviderKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resolved endpoint, models and timeouts of one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub base_url: String,

    /// Model used unless a request names one
    pub model: String,

    /// Model used by the degraded retry after a timeout
    pub fast_model: String,

    pub timeout: Duration,

    /// Timeout of the degraded retry
    pub fast_timeout: Duration,
}

impl ProviderSettings {
    /// Built-in settings for `kind`
    pub fn defaults_for(kind: ProviderKind) -> Self {
        let (base_url, model, fast_model, timeout) = match kind {
            ProviderKind::Anthropic => (
                "https://api.anthropic.com/v1",
                "claude-3-5-sonnet-20240620",
                "claude-3-haiku-20240307",
                30,
            ),
            ProviderKind::OpenAi => ("https://api.openai.com/v1", "gpt-3.5-turbo", "gpt-3.5-turbo", 30),
            ProviderKind::Grok => ("https://api.x.ai/v1", "grok-3-beta", "grok-3-beta", 38),
            ProviderKind::Gemini => (
                "https://generativelanguage.googleapis.com/v1",
                "gemini-1.5-flash-8b",
                "gemini-1.5-flash-8b",
                30,
            ),
        };

        Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
            fast_model: fast_model.to_string(),
            timeout: Duration::from_secs(timeout),
            fast_timeout: Duration::from_secs(15),
        }
    }
}

/// Configured deviations from a provider's built-in settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverrides {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub fast_model: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub fast_timeout: Option<Duration>,
}

/// Provider section of the gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderOverrides,
    pub openai: ProviderOverrides,
    pub grok: ProviderOverrides,
    pub gemini: ProviderOverrides,
}

impl ProvidersConfig {
    fn overrides(&self, kind: ProviderKind) -> &ProviderOverrides {
        match kind {
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Grok => &self.grok,
            ProviderKind::Gemini => &self.gemini,
        }
    }

    /// Effective settings for `kind`
    pub fn settings(&self, kind: ProviderKind) -> ProviderSettings {
        let overrides = self.overrides(kind);
        let defaults = ProviderSettings::defaults_for(kind);
        ProviderSettings {
            base_url: overrides.base_url.clone().unwrap_or(defaults.base_url),
            model: overrides.model.clone().unwrap_or(defaults.model),
            fast_model: overrides.fast_model.clone().unwrap_or(defaults.fast_model),
            timeout: overrides.timeout.unwrap_or(defaults.timeout),
            fast_timeout: overrides.fast_timeout.unwrap_or(defaults.fast_timeout),
        }
    }

    /// Effective settings of every provider
    pub fn iter(&self) -> impl Iterator<Item = (ProviderKind, ProviderSettings)> + '_ {
        ProviderKind::ALL.into_iter().map(move |kind| (kind, self.settings(kind)))
    }

    /// Point `kind` at another base URL
    pub fn with_base_url(mut self, kind: ProviderKind, base_url: impl Into<String>) -> Self {
        let base_url = Some(base_url.into());
        match kind {
            ProviderKind::Anthropic => self.anthropic.base_url = base_url,
            ProviderKind::OpenAi => self.openai.base_url = base_url,
            ProviderKind::Grok => self.grok.base_url = base_url,
            ProviderKind::Gemini => self.gemini.base_url = base_url,
        }
        self
    }
}
