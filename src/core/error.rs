//! # Error Handling Module
//!
//! Every fallible operation of the gateway reports a [`GatewayError`]. The variants follow the
//! failure classes a caller has to react to differently:
//!
//! - transient upstream failures (timeouts, 5xx, connection resets) are retried with backoff
//! - rate limiting is surfaced immediately together with the provider's retry-after hint
//! - an open circuit breaker fails fast without touching the provider
//! - cache backend failures are absorbed by the stores and never reach callers
//! - decryption failures only affect a single vault lookup
//! - validation failures are rejected before any upstream call
//!
//! Mapping these errors onto HTTP status codes belongs to the route handler layer, which lives
//! outside this crate. [`GatewayError::error_type`] gives that layer a stable machine readable tag.

use std::time::Duration;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the gateway core
///
/// `Clone` is required because a single deduplicated upstream result, including its error, is
/// handed to every waiting caller.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Timeout, 5xx or reset from a provider; retried by the circuit breaker
    #[error("Transient upstream failure from {provider}: {message}")]
    TransientUpstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    /// Provider answered 429; never retried automatically
    #[error("Rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// The breaker guarding a provider is open; no upstream attempt was made
    #[error("Circuit breaker '{name}' is open, retry in {retry_after_ms}ms")]
    BreakerOpen { name: String, retry_after_ms: u64 },

    /// Upstream call exceeded its deadline
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Terminal (non-retryable) provider error such as 400/401/403/404
    #[error("Upstream error from {provider} ({status}): {message}")]
    Upstream {
        provider: String,
        status: u16,
        message: String,
    },

    /// Provider answered with a body that does not match its response shape
    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// Cache backend failure. Stores recover locally, so this only shows up in logs.
    #[error("Cache backend error: {message}")]
    CacheBackend { message: String },

    /// A stored credential could not be decrypted
    #[error("Failed to decrypt key {key_id}")]
    Decryption { key_id: String },

    /// No usable credential is configured for a provider
    #[error("No API key available for provider {provider}")]
    MissingCredential { provider: String },

    /// Request rejected before any upstream call
    #[error("Request validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Configuration-related errors (invalid values, unreadable files, ...)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors (key file access, ...)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a validation error for a request field
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient upstream error
    pub fn transient<P: Into<String>, M: Into<String>>(provider: P, message: M, status: Option<u16>) -> Self {
        Self::TransientUpstream {
            provider: provider.into(),
            message: message.into(),
            status,
        }
    }

    /// Create a terminal upstream error
    pub fn upstream<P: Into<String>, M: Into<String>>(provider: P, status: u16, message: M) -> Self {
        Self::Upstream {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    /// Create a cache backend error
    pub fn cache_backend<S: Into<String>>(message: S) -> Self {
        Self::CacheBackend {
            message: message.into(),
        }
    }

    /// Check if this error should be retried
    ///
    /// Rate limiting is deliberately excluded: hammering a provider that asked us to back off
    /// only extends the penalty window.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream { .. } | Self::Timeout { .. } | Self::Io { .. }
        )
    }

    /// Whether this outcome counts as a failure for circuit breaker accounting
    ///
    /// Caller mistakes and local failures say nothing about provider health.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::Upstream { .. }
                | Self::InvalidResponse { .. }
        )
    }

    /// Retry-after hint carried by rate limit and breaker errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::BreakerOpen { retry_after_ms, .. } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }

    /// Get a string representation of the error type
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::TransientUpstream { .. } => "transient_upstream_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Timeout { .. } => "timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::CacheBackend { .. } => "cache_backend_error",
            Self::Decryption { .. } => "decryption_error",
            Self::MissingCredential { .. } => "missing_credential",
            Self::Validation { .. } => "validation_error",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Convenience macro for creating internal errors
///
/// Usage: `internal_error!("Failed to persist {} records", count)`
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::internal(format!($($arg)*))
    };
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid cache type: {}", value)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::transient("openai", "502 bad gateway", Some(502)).is_retryable());
        assert!(GatewayError::Timeout { timeout_ms: 30_000 }.is_retryable());

        let rate_limited = GatewayError::RateLimited {
            provider: "anthropic".to_string(),
            retry_after: Some(Duration::from_secs(20)),
        };
        assert!(!rate_limited.is_retryable());
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(20)));

        assert!(!GatewayError::validation("messages", "empty").is_retryable());
        assert!(!GatewayError::upstream("openai", 401, "bad key").is_retryable());
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(GatewayError::upstream("grok", 500, "boom").counts_as_breaker_failure());
        assert!(!GatewayError::validation("temperature", "out of range").counts_as_breaker_failure());
        assert!(!GatewayError::BreakerOpen {
            name: "grok".to_string(),
            retry_after_ms: 100
        }
        .counts_as_breaker_failure());
    }

    #[test]
    fn test_error_type_and_display() {
        let err = GatewayError::BreakerOpen {
            name: "openai".to_string(),
            retry_after_ms: 1500,
        };
        assert_eq!(err.error_type(), "breaker_open");
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert!(err.to_string().contains("openai"));

        let err = crate::config_error!("bad value {}", 3);
        assert_eq!(err.to_string(), "Configuration error: bad value 3");
    }
}
