//! Retry policies.
//!
//! [`Backoff`] computes the exponential delays the circuit breaker sleeps between attempts.
//! [`RetryPolicy`] is the explicit degrade loop used around whole provider calls: a bounded
//! number of attempts where every retry may rewrite the request (for example to shrink a payload
//! after a timeout).

use crate::core::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff with an upper bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(63) as i32);
        let millis = (self.base.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

type RetryPredicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;
type AttemptTransform<R> = Arc<dyn Fn(u32, &R) -> R + Send + Sync>;

/// Bounded retry loop with a per-attempt request transform
///
/// Attempt numbers are 1-based. The transform receives the number of the attempt that is about
/// to run and the request used by the previous attempt.
pub struct RetryPolicy<R> {
    max_attempts: u32,
    should_retry: RetryPredicate,
    transform: AttemptTransform<R>,
}

impl<R> Clone for RetryPolicy<R> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            should_retry: self.should_retry.clone(),
            transform: self.transform.clone(),
        }
    }
}

impl<R> std::fmt::Debug for RetryPolicy<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl<R: Clone + Send + Sync + 'static> RetryPolicy<R> {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            should_retry: Arc::new(|_| false),
            transform: Arc::new(|_, request: &R| request.clone()),
        }
    }

    /// Retry up to `max_attempts` total attempts on errors accepted by `should_retry`
    pub fn new<P>(max_attempts: u32, should_retry: P) -> Self
    where
        P: Fn(&GatewayError) -> bool + Send + Sync + 'static,
    {
        Self {
            max_attempts: max_attempts.max(1),
            should_retry: Arc::new(should_retry),
            transform: Arc::new(|_, request: &R| request.clone()),
        }
    }

    /// Rewrite the request before each retry
    pub fn with_transform<T>(mut self, transform: T) -> Self
    where
        T: Fn(u32, &R) -> R + Send + Sync + 'static,
    {
        self.transform = Arc::new(transform);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` under this policy
    pub async fn run<T, F, Fut>(&self, initial: R, mut operation: F) -> GatewayResult<T>
    where
        F: FnMut(R) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut request = initial;
        let mut attempt = 1;

        loop {
            match operation(request.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && (self.should_retry)(&err) => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Attempt failed, retrying with transformed request"
                    );
                    request = (self.transform)(attempt, &request);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "Retry policy exhausted");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..6).map(|n| backoff.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[tokio::test]
    async fn test_transform_applied_per_attempt() {
        let policy = RetryPolicy::new(3, |e: &GatewayError| matches!(e, GatewayError::Timeout { .. }))
            .with_transform(|attempt, len: &usize| len / 2 + attempt as usize);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = seen.clone();
        let result: GatewayResult<usize> = policy
            .run(100usize, move |len| {
                let log = log.clone();
                async move {
                    log.lock().push(len);
                    if len > 40 {
                        Err(GatewayError::Timeout { timeout_ms: 10 })
                    } else {
                        Ok(len)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 29);
        assert_eq!(*seen.lock(), vec![100, 52, 29]);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::<()>::new(5, |e| e.is_retryable());
        let result: GatewayResult<()> = policy
            .run((), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::validation("messages", "empty"))
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
