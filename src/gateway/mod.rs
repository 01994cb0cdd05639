//! # Gateway Module
//!
//! Composition root. [`GatewayContext`] owns the cache factory, breaker registry, vault and
//! provider backend. [`CompletionGateway`] chains them into the completion pipeline.

pub mod context;
pub mod service;

pub use context::{GatewayContext, GatewayContextBuilder, GatewayStatus};
pub use service::{CompletionGateway, CompletionSettings, COMPLETION_TAG};
