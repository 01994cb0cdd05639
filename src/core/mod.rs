//! Core building blocks shared by every gateway component: configuration, the error taxonomy,
//! request types, time, retries, background tasks and the circuit breaker.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod retry;
pub mod tasks;
pub mod types;
