//! Circuit Breaker Implementation
//!
//! Guards every provider behind a three state machine so a failing upstream is not hammered:
//!
//! ## States:
//! - **Closed**: Normal operation, calls pass through and consecutive failures are counted
//! - **Open**: Calls fail fast with [`GatewayError::BreakerOpen`] without reaching the provider
//! - **HalfOpen**: One probe call at a time tests whether the provider recovered
//!
//! Open moves to HalfOpen once the reset timeout has elapsed. That is checked lazily on the next
//! call and by an optional monitor task. In HalfOpen a failure reopens the circuit and enough
//! successful probes close it.
//!
//! [`CircuitBreaker::execute`] also owns the retry loop: retryable failures are retried with
//! exponential backoff for as long as the breaker keeps admitting calls.

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::retry::Backoff;
use crate::core::tasks::BackgroundTask;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq)]
enum BreakerState {
    /// Tracks the number of consecutive failures
    Closed { failure_count: u32 },

    /// Records when the circuit was opened
    Open { opened_at: Instant },

    /// Tracks successful probes and whether one is currently running
    HalfOpen { success_count: u32, probe_in_flight: bool },
}

impl BreakerState {
    fn public(&self) -> CircuitState {
        match self {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Successful probes needed in HalfOpen to close the circuit; defaults to `failure_threshold`
    pub success_threshold: Option<u32>,

    /// How long to wait before transitioning from Open to HalfOpen
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Period of the monitor task
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Retries performed by [`CircuitBreaker::execute`]
    pub max_retries: u32,

    /// Delay between retries
    pub backoff: Backoff,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: None,
            reset_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(self.failure_threshold).max(1)
    }
}

/// Called with `(breaker name, from, to)` after every transition
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Counters collected by the circuit breaker
#[derive(Debug, Default)]
struct BreakerCounters {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rejected_requests: AtomicU64,
    times_opened: AtomicU64,
}

/// Snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub times_opened: u64,
    pub state_duration_ms: u64,
}

struct BreakerCore {
    state: BreakerState,
    entered_at: Instant,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Admission granted for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Probe,
}

/// Outstanding admission. A guard dropped before it is settled, because the caller's future was
/// cancelled or timed out, hands the probe slot back.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl PermitGuard<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.permit);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.permit);
    }

    fn release(mut self) {
        self.settled = true;
        self.breaker.release(self.permit);
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(breaker = %self.breaker.name, "Call abandoned before completion");
            self.breaker.release(self.permit);
        }
    }
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Main circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    counters: BreakerCounters,
    on_state_change: RwLock<Option<StateChangeCallback>>,
    monitor: Mutex<Option<BackgroundTask>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed { failure_count: 0 },
                entered_at: Instant::now(),
                last_failure_at: None,
            }),
            counters: BreakerCounters::default(),
            on_state_change: RwLock::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Register the transition callback, replacing any previous one
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        *self.on_state_change.write() = Some(Arc::new(callback));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.core.lock().state.public()
    }

    /// Run `operation` with the configured number of retries
    pub async fn execute<T, F, Fut>(&self, operation: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.execute_with_retries(operation, self.config.max_retries).await
    }

    /// Run `operation` through the breaker, retrying retryable failures up to `retries` times.
    ///
    /// Fails with [`GatewayError::BreakerOpen`] without calling `operation` when the circuit is
    /// open. If the circuit opens between retries, the last upstream error is returned instead.
    pub async fn execute_with_retries<T, F, Fut>(&self, mut operation: F, retries: u32) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut retry = 0;
        let mut last_error: Option<GatewayError> = None;

        loop {
            let permit = match self.acquire() {
                Ok(permit) => permit,
                Err(open) => return Err(last_error.unwrap_or(open)),
            };

            match operation().await {
                Ok(value) => {
                    permit.succeed();
                    return Ok(value);
                }
                Err(err) => {
                    if err.counts_as_breaker_failure() {
                        permit.fail();
                    } else {
                        permit.release();
                    }

                    if !err.is_retryable() || retry >= retries {
                        return Err(err);
                    }

                    let delay = self.config.backoff.delay(retry);
                    retry += 1;
                    warn!(
                        breaker = %self.name,
                        retry,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Call failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(err);
                }
            }
        }
    }

    fn acquire(&self) -> GatewayResult<PermitGuard<'_>> {
        let now = Instant::now();
        let (result, transition) = {
            let mut core = self.core.lock();
            let current = core.state;
            match current {
                BreakerState::Closed { .. } => (Ok(Permit::Normal), None),
                BreakerState::Open { opened_at } => {
                    let elapsed = now.duration_since(opened_at);
                    if elapsed >= self.config.reset_timeout {
                        let transition = Self::transition(
                            &mut core,
                            BreakerState::HalfOpen {
                                success_count: 0,
                                probe_in_flight: true,
                            },
                            now,
                        );
                        (Ok(Permit::Probe), transition)
                    } else {
                        let retry_after = self.config.reset_timeout - elapsed;
                        (Err(self.open_error(retry_after)), None)
                    }
                }
                BreakerState::HalfOpen {
                    success_count,
                    probe_in_flight: false,
                } => {
                    core.state = BreakerState::HalfOpen {
                        success_count,
                        probe_in_flight: true,
                    };
                    (Ok(Permit::Probe), None)
                }
                BreakerState::HalfOpen {
                    probe_in_flight: true,
                    ..
                } => (Err(self.open_error(Duration::ZERO)), None),
            }
        };

        match &result {
            Ok(_) => {
                self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.rejected_requests.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, "Call rejected by open circuit");
            }
        }
        self.notify(transition);
        result.map(|permit| PermitGuard {
            breaker: self,
            permit,
            settled: false,
        })
    }

    fn open_error(&self, retry_after: Duration) -> GatewayError {
        GatewayError::BreakerOpen {
            name: self.name.clone(),
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }

    fn record_success(&self, permit: Permit) {
        self.counters.successful_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let transition = {
            let mut core = self.core.lock();
            let current = core.state;
            match current {
                BreakerState::Closed { failure_count } if failure_count > 0 => {
                    core.state = BreakerState::Closed { failure_count: 0 };
                    None
                }
                BreakerState::HalfOpen { success_count, .. } if permit == Permit::Probe => {
                    let success_count = success_count + 1;
                    if success_count >= self.config.success_threshold() {
                        Self::transition(&mut core, BreakerState::Closed { failure_count: 0 }, now)
                    } else {
                        core.state = BreakerState::HalfOpen {
                            success_count,
                            probe_in_flight: false,
                        };
                        None
                    }
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn record_failure(&self, permit: Permit) {
        self.counters.failed_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let transition = {
            let mut core = self.core.lock();
            core.last_failure_at = Some(Utc::now());
            let current = core.state;
            match current {
                BreakerState::Closed { failure_count } => {
                    let failure_count = failure_count + 1;
                    if failure_count >= self.config.failure_threshold {
                        Self::transition(&mut core, BreakerState::Open { opened_at: now }, now)
                    } else {
                        core.state = BreakerState::Closed { failure_count };
                        None
                    }
                }
                BreakerState::HalfOpen { .. } if permit == Permit::Probe => {
                    Self::transition(&mut core, BreakerState::Open { opened_at: now }, now)
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    /// Outcome that neither helps nor hurts; frees the probe slot
    fn release(&self, permit: Permit) {
        if permit != Permit::Probe {
            return;
        }
        let mut core = self.core.lock();
        if let BreakerState::HalfOpen { success_count, .. } = core.state {
            core.state = BreakerState::HalfOpen {
                success_count,
                probe_in_flight: false,
            };
        }
    }

    fn transition(core: &mut BreakerCore, to: BreakerState, now: Instant) -> Transition {
        let from = core.state.public();
        core.state = to;
        core.entered_at = now;
        let to = to.public();
        (from != to).then_some((from, to))
    }

    fn notify(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };

        if to == CircuitState::Open {
            self.counters.times_opened.fetch_add(1, Ordering::Relaxed);
            warn!(breaker = %self.name, from = %from, "Circuit opened");
        } else {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit state changed");
        }
        metrics::counter!(
            crate::observability::metrics::BREAKER_TRANSITIONS,
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        let callback = self.on_state_change.read().clone();
        if let Some(callback) = callback {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&self.name, from, to)));
            if outcome.is_err() {
                warn!(breaker = %self.name, from = %from, to = %to, "State change callback panicked");
            }
        }
    }

    /// Move Open to HalfOpen if the reset timeout has elapsed; used by the monitor
    pub fn check_reset_timeout(&self) -> CircuitState {
        let now = Instant::now();
        let (state, transition) = {
            let mut core = self.core.lock();
            let current = core.state;
            let transition = match current {
                BreakerState::Open { opened_at } if now.duration_since(opened_at) >= self.config.reset_timeout => {
                    Self::transition(
                        &mut core,
                        BreakerState::HalfOpen {
                            success_count: 0,
                            probe_in_flight: false,
                        },
                        now,
                    )
                }
                _ => None,
            };
            (core.state.public(), transition)
        };
        self.notify(transition);
        state
    }

    /// Start the periodic reset-timeout check. Does nothing if it already runs.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().map(|m| m.is_running()).unwrap_or(false) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *monitor = Some(BackgroundTask::spawn_interval(
            "circuit-breaker-monitor",
            self.config.monitor_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(breaker) = weak.upgrade() {
                        breaker.check_reset_timeout();
                    }
                }
            },
        ));
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().as_ref().map(|m| m.is_running()).unwrap_or(false)
    }

    /// Stop the monitor task
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }

    /// Manually close the circuit and clear its counters
    pub fn reset(&self) {
        let transition = {
            let mut core = self.core.lock();
            core.last_failure_at = None;
            Self::transition(&mut core, BreakerState::Closed { failure_count: 0 }, Instant::now())
        };
        self.notify(transition);
    }

    /// Manually open the circuit (admin override)
    pub fn force_open(&self) {
        let now = Instant::now();
        let transition = {
            let mut core = self.core.lock();
            Self::transition(&mut core, BreakerState::Open { opened_at: now }, now)
        };
        self.notify(transition);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let core = self.core.lock();
        let (failure_count, success_count) = match core.state {
            BreakerState::Closed { failure_count } => (failure_count, 0),
            BreakerState::Open { .. } => (0, 0),
            BreakerState::HalfOpen { success_count, .. } => (0, success_count),
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: core.state.public(),
            failure_count,
            success_count,
            last_failure_at: core.last_failure_at,
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            successful_requests: self.counters.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.counters.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.counters.rejected_requests.load(Ordering::Relaxed),
            times_opened: self.counters.times_opened.load(Ordering::Relaxed),
            state_duration_ms: core.entered_at.elapsed().as_millis() as u64,
        }
    }
}

/// Circuit breaker registry, one breaker per provider
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    monitor: bool,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.lock().len())
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Breakers created through the registry start their monitor when `monitor` is set
    pub fn new(default_config: CircuitBreakerConfig, monitor: bool) -> Self {
        Self {
            default_config,
            monitor,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for `name` using the registry's default configuration
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_config.clone())
    }

    /// Get or create a circuit breaker for the given name
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }

        let breaker = Arc::new(CircuitBreaker::new(name, config));
        if self.monitor {
            breaker.start_monitor();
        }
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.lock().values().cloned().collect()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.get_all().iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Stop every monitor task
    pub async fn shutdown_all(&self) {
        for breaker in self.get_all() {
            breaker.shutdown().await;
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), false)
    }
}
