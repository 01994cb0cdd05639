//! # Structured Logging
//!
//! Subscriber setup for the `tracing` macros used throughout the crate, and the
//! [`SecretRedactor`] that scrubs credentials out of anything headed for a log line.
//!
//! ## Key Features
//! - JSON or text output selected by configuration
//! - `RUST_LOG` wins over the configured level when set
//! - Idempotent initialization (tests and embedders may already own the subscriber)
//! - Redaction of API keys, bearer tokens, key query parameters and key-like JSON fields

use crate::core::config::LoggingConfig;
use crate::core::error::{GatewayError, GatewayResult};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const REPLACEMENT: &str = "[REDACTED]";

/// Initialize the global tracing subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| GatewayError::config(format!("Invalid log level '{}': {}", config.level, e)))?,
    };

    let installed = match config.format.to_lowercase().as_str() {
        "json" => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
            .is_ok(),
        _ => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        info!(level = %config.level, format = %config.format, "Structured logging initialized");
    } else {
        debug!("Tracing subscriber already initialized, skipping initialization");
    }
    Ok(installed)
}

/// Masks credentials in free text
#[derive(Debug, Clone)]
pub struct SecretRedactor {
    rules: Vec<(Regex, String)>,
}

impl SecretRedactor {
    /// Built-in rules plus JSON fields named in `extra_fields`
    pub fn new(extra_fields: &[&str]) -> GatewayResult<Self> {
        let mut fields = vec![
            "api_key",
            "apiKey",
            "x-api-key",
            "authorization",
            "key",
            "secret",
            "token",
            "password",
            "encryption_key",
        ];
        fields.extend_from_slice(extra_fields);
        let field_alternation = fields
            .iter()
            .map(|f| regex::escape(f))
            .collect::<Vec<_>>()
            .join("|");

        let rules = [
            (
                format!(r#"(?i)"({})"\s*:\s*"[^"]*""#, field_alternation),
                format!(r#""$1":"{}""#, REPLACEMENT),
            ),
            (r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*".to_string(), format!("Bearer {}", REPLACEMENT)),
            (r"([?&](?:key|api_key)=)[^&\s]+".to_string(), format!("${{1}}{}", REPLACEMENT)),
            (r"\bsk-[A-Za-z0-9_\-]{8,}".to_string(), REPLACEMENT.to_string()),
            (r"\bxai-[A-Za-z0-9_\-]{8,}".to_string(), REPLACEMENT.to_string()),
            (r"\bAIza[0-9A-Za-z_\-]{20,}".to_string(), REPLACEMENT.to_string()),
        ];

        let rules = rules
            .into_iter()
            .map(|(pattern, replacement)| {
                Regex::new(&pattern)
                    .map(|regex| (regex, replacement))
                    .map_err(|e| GatewayError::config(format!("Invalid redaction pattern: {}", e)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self { rules })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for (pattern, replacement) in &self.rules {
            redacted = pattern.replace_all(&redacted, replacement.as_str()).into_owned();
        }
        redacted
    }
}

/// Redact with the built-in rules.
///
/// If the rules cannot be compiled the whole text is withheld.
pub fn redact_secrets(text: &str) -> String {
    static REDACTOR: OnceLock<Option<SecretRedactor>> = OnceLock::new();
    match REDACTOR.get_or_init(|| SecretRedactor::new(&[]).ok()) {
        Some(redactor) => redactor.redact(text),
        None => REPLACEMENT.to_string(),
    }
}
