//! # Metrics
//!
//! Counter names emitted through the `metrics` facade. The library never installs a recorder;
//! whoever embeds the gateway decides where the numbers go.

use metrics::{describe_counter, Unit};

pub const CACHE_HITS: &str = "gateway_cache_hits_total";
pub const CACHE_MISSES: &str = "gateway_cache_misses_total";
pub const CACHE_EVICTIONS: &str = "gateway_cache_evictions_total";
pub const BREAKER_TRANSITIONS: &str = "gateway_breaker_transitions_total";
pub const DEDUP_JOINED: &str = "gateway_dedup_joined_total";
pub const UPSTREAM_REQUESTS: &str = "gateway_upstream_requests_total";

/// Register descriptions for every gateway counter with the installed recorder
pub fn describe_metrics() {
    describe_counter!(CACHE_HITS, Unit::Count, "Completions served from the response cache");
    describe_counter!(CACHE_MISSES, Unit::Count, "Completion lookups that missed the response cache");
    describe_counter!(CACHE_EVICTIONS, Unit::Count, "Entries evicted from the in-memory cache under pressure");
    describe_counter!(BREAKER_TRANSITIONS, Unit::Count, "Circuit breaker state transitions by breaker and target state");
    describe_counter!(DEDUP_JOINED, Unit::Count, "Callers that joined an identical in-flight provider call");
    describe_counter!(UPSTREAM_REQUESTS, Unit::Count, "Provider HTTP calls by provider and outcome");
}
