//! Load Balancer Service
//!
//! Selects healthy instances from the registry and runs calls against them
//! with retry, connection accounting and outcome feedback. Strategy logic
//! itself lives in `domain::services::LoadBalancer`.

use crate::application::service_registry::ServiceRegistry;
use crate::domain::entities::{InstanceSnapshot, ServiceInstance};
use crate::domain::services::{LoadBalancer, SelectionContext};
use crate::domain::value_objects::LoadBalancingStrategy;
use crate::error::{GatewayError, GatewayResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Request timestamps kept per service for the requests-per-minute figure.
const REQUEST_HISTORY_LIMIT: usize = 1000;

/// Load balancer configuration.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// Default selection strategy
    pub strategy: LoadBalancingStrategy,
    /// Total attempts per request, first one included
    pub max_retries: u32,
    /// Base delay between attempts; attempt `n` waits `retry_delay * n`
    pub retry_delay: Duration,
    /// Deadline for a single attempt
    pub timeout: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Per-service request statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadBalancerStats {
    pub service: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: f64,
    pub requests_per_minute: usize,
}

#[derive(Debug, Default)]
struct StatsRecorder {
    total: u64,
    successful: u64,
    failed: u64,
    latency_sum: Duration,
    history: VecDeque<Instant>,
}

impl StatsRecorder {
    fn record(&mut self, success: bool, latency: Duration, at: Instant) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.latency_sum += latency;

        if self.history.len() == REQUEST_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(at);
    }

    fn view(&self, service: &str, now: Instant) -> LoadBalancerStats {
        let minute = Duration::from_secs(60);
        let average_latency_ms = if self.total == 0 {
            0.0
        } else {
            self.latency_sum.as_secs_f64() * 1000.0 / self.total as f64
        };
        LoadBalancerStats {
            service: service.to_string(),
            total_requests: self.total,
            successful_requests: self.successful,
            failed_requests: self.failed,
            average_latency_ms,
            requests_per_minute: self
                .history
                .iter()
                .filter(|t| now.saturating_duration_since(**t) <= minute)
                .count(),
        }
    }
}

/// Load balancer service.
pub struct LoadBalancerService {
    config: LoadBalancerConfig,
    registry: Arc<ServiceRegistry>,
    /// Round-robin cursor per service
    cursors: DashMap<String, AtomicUsize>,
    stats: DashMap<String, Mutex<StatsRecorder>>,
}

impl LoadBalancerService {
    pub fn new(registry: Arc<ServiceRegistry>, config: LoadBalancerConfig) -> Self {
        Self {
            config,
            registry,
            cursors: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Select a healthy instance of `service` using `strategy`.
    ///
    /// The round-robin cursor is shared by all callers of a service and
    /// taken modulo the current healthy count, so a membership change can
    /// skew one cycle.
    pub fn select(
        &self,
        service: &str,
        strategy: LoadBalancingStrategy,
        ctx: &SelectionContext,
    ) -> GatewayResult<Arc<ServiceInstance>> {
        let healthy = self.registry.healthy_instances(service);
        if healthy.is_empty() {
            tracing::warn!("no healthy instances available for {}", service);
            return Err(GatewayError::NoHealthyInstances {
                service: service.to_string(),
            });
        }

        let snapshots: Vec<InstanceSnapshot> = healthy.iter().map(|i| i.snapshot()).collect();
        let cursor = match strategy {
            LoadBalancingStrategy::RoundRobin => self
                .cursors
                .entry(service.to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        let index = LoadBalancer::pick_index(strategy, &snapshots, ctx, cursor, &mut rand::thread_rng())
            .ok_or_else(|| GatewayError::NoHealthyInstances {
                service: service.to_string(),
            })?;

        let instance = healthy[index].clone();
        tracing::debug!("selected {} for {} ({})", instance.id, service, strategy);
        Ok(instance)
    }

    /// Select with the configured default strategy.
    pub fn discover(&self, service: &str, ctx: &SelectionContext) -> GatewayResult<Arc<ServiceInstance>> {
        self.select(service, self.config.strategy, ctx)
    }

    /// Run `call` against a selected instance.
    ///
    /// Each attempt holds a connection lease for its whole duration. Only
    /// `Backend` and `Timeout` failures are retried, with linear backoff;
    /// every other error is returned as-is on the first occurrence.
    pub async fn execute_request<F, Fut, T>(
        &self,
        service: &str,
        ctx: &SelectionContext,
        call: F,
    ) -> GatewayResult<T>
    where
        F: Fn(Arc<ServiceInstance>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let attempts = self.config.max_retries.max(1);
        let started = Instant::now();
        let mut attempt = 1;
        let mut last_error: Option<GatewayError> = None;

        loop {
            let instance = match self.discover(service, ctx) {
                Ok(instance) => instance,
                Err(err) => {
                    // A failed attempt may have taken the last healthy
                    // instance out; the request still ends with that failure.
                    self.record_stats(service, false, started.elapsed());
                    return Err(last_error.unwrap_or(err));
                }
            };
            let outcome = {
                let _lease = instance.acquire();
                let attempt_started = Instant::now();
                let result = match tokio::time::timeout(self.config.timeout, call(instance.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout {
                        after: self.config.timeout,
                    }),
                };
                (result, attempt_started.elapsed())
            };

            match outcome {
                (Ok(value), latency) => {
                    self.registry.record_call_outcome(&instance, true, latency);
                    self.record_stats(service, true, started.elapsed());
                    return Ok(value);
                }
                (Err(err), latency) => {
                    if err.is_retryable() {
                        self.registry.record_call_outcome(&instance, false, latency);
                    }

                    if !err.is_retryable() || attempt >= attempts {
                        self.record_stats(service, false, started.elapsed());
                        return Err(err);
                    }

                    tracing::warn!(
                        "attempt {}/{} to {} via {} failed: {}",
                        attempt,
                        attempts,
                        service,
                        instance.id,
                        err
                    );
                    last_error = Some(err);
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    fn record_stats(&self, service: &str, success: bool, latency: Duration) {
        self.stats
            .entry(service.to_string())
            .or_default()
            .lock()
            .record(success, latency, Instant::now());
    }

    /// Statistics for one service.
    pub fn stats(&self, service: &str) -> Option<LoadBalancerStats> {
        let now = Instant::now();
        self.stats.get(service).map(|s| s.lock().view(service, now))
    }

    /// Statistics for every service that saw traffic, sorted by name.
    pub fn all_stats(&self) -> Vec<LoadBalancerStats> {
        let now = Instant::now();
        let mut all: Vec<LoadBalancerStats> = self
            .stats
            .iter()
            .map(|entry| entry.value().lock().view(entry.key(), now))
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn reset_stats(&self) {
        self.stats.clear();
        tracing::info!("load balancer statistics reset");
    }
}
