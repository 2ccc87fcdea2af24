//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by failing fast on backends that keep
//! failing. Each breaker keeps its state behind one lock so a transition is
//! always decided from a consistent snapshot of its counters.

use crate::domain::entities::now_millis;
use crate::error::{GatewayError, GatewayResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Deadline for a single wrapped call
    pub timeout: Duration,
    /// Failure percentage (0-100) above which the circuit opens
    pub error_threshold_percentage: f64,
    /// Duration to keep circuit open before admitting a trial call
    pub reset_timeout: Duration,
    /// Length of the rolling window for request/failure counts
    pub monitoring_period: Duration,
    /// Requests needed in the window before the threshold is evaluated
    pub minimum_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(10),
            minimum_requests: 5,
        }
    }
}

/// Granularity of breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerScope {
    /// One breaker per logical service
    #[default]
    Service,
    /// One breaker per instance
    Instance,
}

impl BreakerScope {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "instance" => Self::Instance,
            _ => Self::Service,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    #[default]
    Closed,
    /// Circuit tripped - requests blocked
    Open,
    /// Testing recovery - a single trial request allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    // Rolling window
    requests: u32,
    failures: u32,
    successes: u32,
    window_started: Instant,
    // Transition bookkeeping
    last_failure_ms: Option<u64>,
    next_retry: Option<Instant>,
    trial_in_flight: bool,
    // Lifetime
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_timeouts: u64,
    total_rejections: u64,
    avg_latency_ms: f64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            successes: 0,
            window_started: Instant::now(),
            last_failure_ms: None,
            next_retry: None,
            trial_in_flight: false,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            total_timeouts: 0,
            total_rejections: 0,
            avg_latency_ms: 0.0,
        }
    }

    fn reset_window(&mut self, now: Instant) {
        self.requests = 0;
        self.failures = 0;
        self.successes = 0;
        self.window_started = now;
    }

    fn roll_window(&mut self, now: Instant, period: Duration) {
        if now.duration_since(self.window_started) >= period {
            self.reset_window(now);
        }
    }

    /// Running mean over completed calls; timeouts count as failures.
    fn record_latency(&mut self, latency: Duration) {
        let n = (self.total_successes + self.total_failures).max(1) as f64;
        let ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (ms - self.avg_latency_ms) / n;
    }
}

/// Fault isolator for one backend (service or instance).
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without triggering the open → half-open transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejected calls return `CircuitOpen` and never invoke `operation`.
    /// Admitted calls race the configured timeout; the losing operation is
    /// dropped and the call counts as a `Timeout` failure.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut permit = self.admit()?;
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                after: self.config.timeout,
            }),
        };

        let latency = started.elapsed();
        match &outcome {
            Ok(_) => self.on_success(latency, permit.trial),
            Err(GatewayError::Timeout { .. }) => self.on_failure(latency, permit.trial, true),
            Err(_) => self.on_failure(latency, permit.trial, false),
        }
        permit.completed = true;

        outcome
    }

    /// Decide whether a call may proceed.
    fn admit(&self) -> GatewayResult<Permit<'_>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.roll_window(now, self.config.monitoring_period);

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let due = inner.next_retry.map(|at| now >= at).unwrap_or(true);
                if !due {
                    inner.total_rejections += 1;
                    return Err(self.open_error());
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!("circuit breaker for {} transitioning to half-open", self.name);
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                true
            }
        };

        inner.requests += 1;
        inner.total_requests += 1;

        Ok(Permit {
            breaker: self,
            trial,
            completed: false,
        })
    }

    fn open_error(&self) -> GatewayError {
        GatewayError::CircuitOpen {
            key: self.name.clone(),
        }
    }

    fn on_success(&self, latency: Duration, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.roll_window(now, self.config.monitoring_period);
        inner.successes += 1;
        inner.total_successes += 1;
        inner.record_latency(latency);

        if trial && inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.trial_in_flight = false;
            inner.next_retry = None;
            inner.reset_window(now);
            tracing::info!("circuit breaker for {} closed (recovered)", self.name);
        }
    }

    fn on_failure(&self, latency: Duration, trial: bool, timed_out: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.roll_window(now, self.config.monitoring_period);
        inner.failures += 1;
        inner.total_failures += 1;
        if timed_out {
            inner.total_timeouts += 1;
        }
        inner.last_failure_ms = Some(now_millis());
        inner.record_latency(latency);

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                inner.next_retry = Some(now + self.config.reset_timeout);
                tracing::warn!(
                    "circuit breaker for {} re-opened (failed in half-open)",
                    self.name
                );
            }
            CircuitState::Closed if self.should_trip(&inner) => {
                inner.state = CircuitState::Open;
                inner.next_retry = Some(now + self.config.reset_timeout);
                tracing::warn!(
                    "circuit breaker for {} opened after {}/{} failures",
                    self.name,
                    inner.failures,
                    inner.requests
                );
            }
            // Late outcomes of calls admitted before a transition do not
            // move the state.
            _ => {}
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        if inner.requests < self.config.minimum_requests || inner.requests == 0 {
            return false;
        }
        let failure_pct = inner.failures as f64 * 100.0 / inner.requests as f64;
        failure_pct > self.config.error_threshold_percentage
    }

    /// Force the circuit open, e.g. for planned maintenance.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.trial_in_flight = false;
        inner.next_retry = Some(Instant::now() + self.config.reset_timeout);
        tracing::warn!("circuit breaker for {} forced open", self.name);
    }

    /// Force the circuit closed and clear the rolling window.
    pub fn force_close(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.trial_in_flight = false;
        inner.next_retry = None;
        inner.reset_window(now);
        tracing::info!("circuit breaker for {} forced closed", self.name);
    }

    /// Force the circuit half-open; the next call is the trial.
    pub fn force_half_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::HalfOpen;
        inner.trial_in_flight = false;
        inner.next_retry = None;
        tracing::info!("circuit breaker for {} forced half-open", self.name);
    }

    /// Zero the rolling counters now.
    pub fn reset_window(&self) {
        self.inner.lock().reset_window(Instant::now());
    }

    /// Point-in-time view for operators.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.roll_window(now, self.config.monitoring_period);

        let failure_rate = if inner.requests == 0 {
            0.0
        } else {
            inner.failures as f64 * 100.0 / inner.requests as f64
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            requests: inner.requests,
            failures: inner.failures,
            successes: inner.successes,
            failure_rate,
            last_failure_ms: inner.last_failure_ms,
            next_retry_in_ms: inner
                .next_retry
                .filter(|_| inner.state == CircuitState::Open)
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_timeouts: inner.total_timeouts,
            total_rejections: inner.total_rejections,
            avg_latency_ms: inner.avg_latency_ms,
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }
}

/// Admission ticket for one call.
///
/// If the call is cancelled before reporting an outcome, dropping the
/// permit frees the half-open trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    completed: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.completed {
            self.breaker.release_trial();
        }
    }
}

/// Serializable breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub requests: u32,
    pub failures: u32,
    pub successes: u32,
    pub failure_rate: f64,
    pub last_failure_ms: Option<u64>,
    pub next_retry_in_ms: Option<u64>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_timeouts: u64,
    pub total_rejections: u64,
    pub avg_latency_ms: f64,
}

/// Owner of all breakers, keyed by service name or instance id.
pub struct BreakerManager {
    config: CircuitBreakerConfig,
    scope: BreakerScope,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerManager {
    pub fn new(config: CircuitBreakerConfig, scope: BreakerScope) -> Self {
        Self {
            config,
            scope,
            breakers: DashMap::new(),
        }
    }

    pub fn scope(&self) -> BreakerScope {
        self.scope
    }

    /// Breaker key for a call to `instance_id` of `service`.
    pub fn key_for(&self, service: &str, instance_id: &str) -> String {
        match self.scope {
            BreakerScope::Service => service.to_string(),
            BreakerScope::Instance => instance_id.to_string(),
        }
    }

    /// Get or create the breaker for a key.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| b.clone())
    }

    /// Drop a breaker, e.g. when its instance is deregistered.
    pub fn remove(&self, key: &str) -> bool {
        self.breakers.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// State of every breaker, sorted by key.
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn force_open(&self, key: &str) -> bool {
        self.get(key).map(|b| b.force_open()).is_some()
    }

    pub fn force_close(&self, key: &str) -> bool {
        self.get(key).map(|b| b.force_close()).is_some()
    }

    pub fn force_half_open(&self, key: &str) -> bool {
        self.get(key).map(|b| b.force_half_open()).is_some()
    }
}

impl Default for BreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), BreakerScope::Service)
    }
}
