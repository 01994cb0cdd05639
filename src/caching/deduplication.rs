//! # Request Deduplication Module
//!
//! Collapses concurrent identical provider calls into one. The first caller for a fingerprint
//! spawns the call as its own task and parks a shared handle to it in the pool; callers arriving
//! while it is in flight await the same handle and observe the identical result, success or
//! error. The pool entry is removed by the task itself when the call settles.
//!
//! The pool is bounded. Once it is full, new fingerprints bypass deduplication and call the
//! provider directly rather than being rejected.
//!
//! A caller that stops waiting (for example on its own timeout) only drops its handle; the shared
//! call keeps running for everyone else.

use crate::core::error::{GatewayError, GatewayResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Deduplication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    /// Enable request deduplication
    pub enabled: bool,

    /// Maximum number of distinct in-flight fingerprints
    pub max_pool_size: usize,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pool_size: 5,
        }
    }
}

type SharedCall<T> = Shared<BoxFuture<'static, GatewayResult<T>>>;

/// In-flight request tracking
struct PendingRequest<T: Clone> {
    call: SharedCall<T>,
    abort: AbortHandle,
    started_at: Instant,
}

type Pool<T> = Arc<Mutex<HashMap<String, PendingRequest<T>>>>;

enum Admission<T: Clone, F> {
    Shared(SharedCall<T>),
    Bypass(F),
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeduplicationStats {
    pub in_flight: usize,
    pub started: u64,
    pub joined: u64,
    pub bypassed: u64,
}

/// Request deduplicator keyed by request fingerprint
pub struct RequestDeduplicator<T: Clone> {
    config: DeduplicationConfig,
    pool: Pool<T>,
    started: AtomicU64,
    joined: AtomicU64,
    bypassed: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> RequestDeduplicator<T> {
    /// Create a new deduplicator
    pub fn new(config: DeduplicationConfig) -> Self {
        Self {
            config,
            pool: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
        }
    }

    /// Run `call` at most once concurrently per `key`.
    ///
    /// `call` is only invoked when no identical request is in flight. Must be called from within
    /// a tokio runtime.
    pub async fn dedupe<F, Fut>(&self, key: &str, call: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        if !self.config.enabled {
            return call().await;
        }

        match self.admit(key, call) {
            Admission::Shared(call) => call.await,
            Admission::Bypass(call) => {
                self.bypassed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    max_pool_size = self.config.max_pool_size,
                    "Deduplication pool full, calling provider directly"
                );
                call().await
            }
        }
    }

    /// Join or start the shared call for `key`, or hand `call` back when the pool is full
    fn admit<F, Fut>(&self, key: &str, call: F) -> Admission<T, F>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let mut pool = self.pool.lock();

        if let Some(pending) = pool.get(key) {
            self.joined.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(crate::observability::metrics::DEDUP_JOINED).increment(1);
            debug!(key = %key, "Joining in-flight request");
            return Admission::Shared(pending.call.clone());
        }

        if pool.len() >= self.config.max_pool_size {
            return Admission::Bypass(call);
        }

        let owner = Arc::clone(&self.pool);
        let owned_key = key.to_string();
        let future = call();

        // The lock is still held here, so the task cannot remove its entry before it
        // has been inserted.
        let handle = tokio::spawn(async move {
            let result = future.await;
            owner.lock().remove(&owned_key);
            result
        });
        let abort = handle.abort_handle();

        let shared: SharedCall<T> = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(GatewayError::internal("in-flight request was cancelled")),
                Err(e) => Err(GatewayError::internal(format!("in-flight request failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        pool.insert(
            key.to_string(),
            PendingRequest {
                call: shared.clone(),
                abort,
                started_at: Instant::now(),
            },
        );
        self.started.fetch_add(1, Ordering::Relaxed);
        Admission::Shared(shared)
    }

    /// Number of distinct in-flight requests
    pub fn in_flight(&self) -> usize {
        self.pool.lock().len()
    }

    /// Whether `key` currently has a request in flight
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.pool.lock().contains_key(key)
    }

    /// Age of the oldest in-flight request
    pub fn oldest_in_flight(&self) -> Option<std::time::Duration> {
        self.pool.lock().values().map(|p| p.started_at.elapsed()).max()
    }

    /// Abort every in-flight request; waiters receive an internal error
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingRequest<T>> = self.pool.lock().drain().map(|(_, p)| p).collect();
        for pending in &drained {
            pending.abort.abort();
        }
        drained.len()
    }

    pub fn stats(&self) -> DeduplicationStats {
        DeduplicationStats {
            in_flight: self.in_flight(),
            started: self.started.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_call(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, GatewayResult<u32>> {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_identical_calls_share_one_invocation() {
        let dedup = RequestDeduplicator::<u32>::new(DeduplicationConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..10).map(|i| dedup.dedupe("same", counting_call(&calls, i)))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(r, Ok(0))));
        assert_eq!(dedup.in_flight(), 0);
        assert_eq!(dedup.stats().joined, 9);
    }

    #[tokio::test]
    async fn test_errors_are_shared_too() {
        let dedup = RequestDeduplicator::<u32>::new(DeduplicationConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..3).map(|_| {
            let calls = calls.clone();
            dedup.dedupe("failing", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<u32, _>(GatewayError::transient("grok", "503", Some(503)))
                }
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(GatewayError::TransientUpstream { .. }))));
    }

    #[tokio::test]
    async fn test_full_pool_bypasses_deduplication() {
        let dedup = RequestDeduplicator::<u32>::new(DeduplicationConfig {
            enabled: true,
            max_pool_size: 2,
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let keys = ["a", "b", "c", "c"];
        let results = join_all(keys.iter().map(|k| dedup.dedupe(k, counting_call(&calls, 7)))).await;

        assert!(results.iter().all(|r| matches!(r, Ok(7))));
        // "a" and "b" fill the pool, both "c" calls go straight through.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(dedup.stats().bypassed, 2);
    }

    #[tokio::test]
    async fn test_key_released_after_settle() {
        let dedup = RequestDeduplicator::<u32>::new(DeduplicationConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(dedup.dedupe("k", counting_call(&calls, 1)).await.unwrap(), 1);
        assert_eq!(dedup.dedupe("k", counting_call(&calls, 2)).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel_shared_call() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new(DeduplicationConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let impatient = tokio::time::timeout(
            Duration::from_millis(5),
            dedup.dedupe("slow", counting_call(&calls, 42)),
        )
        .await;
        assert!(impatient.is_err());
        assert!(dedup.is_in_flight("slow"));

        let patient = dedup.dedupe("slow", counting_call(&calls, 0)).await;
        assert_eq!(patient.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new(DeduplicationConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let dedup = dedup.clone();
            let call = counting_call(&calls, 1);
            tokio::spawn(async move { dedup.dedupe("k", call).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dedup.cancel_all(), 1);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Internal { .. })));
    }
}
