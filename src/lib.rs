//! # AI Gateway Library
//!
//! Caching, resilience and request-shaping core for a gateway in front of generative-AI provider
//! APIs (Anthropic, OpenAI, Grok, Gemini).
//!
//! A completion request flows through:
//! - the response cache ([`caching`]), memory or Redis backed, selected by [`caching::CacheFactory`]
//! - the payload optimizer ([`optimizer`]) that shrinks long conversations
//! - the credential vault ([`vault`]) holding provider keys encrypted at rest
//! - the request deduplicator that collapses identical in-flight calls
//! - a per-provider circuit breaker ([`core::circuit_breaker`]) with retries
//! - the provider HTTP client ([`providers`])
//!
//! [`GatewayContext`] wires all of them together.

/// Error taxonomy, configuration, request types, clock, retries and the circuit breaker
pub mod core;

/// Response cache stores, the cache factory, key generation and deduplication
pub mod caching;

/// Composition root and the completion pipeline
pub mod gateway;

/// Structured logging, secret redaction and metric names
pub mod observability;

/// Outbound payload shaping
pub mod optimizer;

/// Provider HTTP client and wire types
pub mod providers;

/// Encrypted API key storage
pub mod vault;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{CachePolicy, CompletionRequest, Message, ProviderKind, Role};
pub use gateway::{CompletionGateway, GatewayContext, GatewayStatus};
pub use providers::CompletionResponse;
