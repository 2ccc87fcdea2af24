//! In-Memory Metrics Collector
//!
//! Implements `MetricsSink` with DashMap breakdowns and atomic counters.
//! Passive: it only observes completed requests and never touches the
//! registry or the breakers.

use crate::domain::entities::{now_millis, RequestMetric};
use crate::domain::ports::MetricsSink;
use crate::domain::value_objects::HealthLevel;
use crate::infrastructure::shutdown::ShutdownController;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Samples used for the rolling average latency.
const LATENCY_WINDOW: usize = 100;

/// Hard cap on retained request records.
const MAX_RETAINED: usize = 100_000;

/// Distinct keys tracked per string breakdown before new keys fold into
/// `OTHER_KEY`.
const MAX_BREAKDOWN_KEYS: usize = 1_000;

/// Overflow bucket of the path and method breakdowns.
const OTHER_KEY: &str = "other";

#[derive(Debug, Clone)]
pub struct MetricsCollectorConfig {
    /// How long request records are kept
    pub retention: Duration,
    /// Interval of the background prune
    pub cleanup_interval: Duration,
}

impl Default for MetricsCollectorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct ServiceCounters {
    total: AtomicU64,
    errors: AtomicU64,
}

/// Per-service traffic figures.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceTraffic {
    pub total_requests: u64,
    pub error_requests: u64,
    pub health: HealthLevel,
}

/// Serializable snapshot of everything collected.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub error_requests: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub requests_per_second: f64,
    pub by_method: BTreeMap<String, u64>,
    pub by_path: BTreeMap<String, u64>,
    pub by_status: BTreeMap<u16, u64>,
    pub by_service: BTreeMap<String, ServiceTraffic>,
    pub retained_requests: usize,
}

fn bump<K>(map: &DashMap<K, AtomicU64>, key: K)
where
    K: std::hash::Hash + Eq,
{
    map.entry(key).or_default().fetch_add(1, Ordering::Relaxed);
}

/// Count `key` unless the map is full, in which case the hit lands in
/// `OTHER_KEY`. Concurrent inserts may overshoot the cap slightly.
fn bump_capped(map: &DashMap<String, AtomicU64>, key: &str, cap: usize) {
    if let Some(counter) = map.get(key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let key = if map.len() < cap { key } else { OTHER_KEY };
    bump(map, key.to_string());
}

fn collect<K>(map: &DashMap<K, AtomicU64>) -> BTreeMap<K, u64>
where
    K: std::hash::Hash + Eq + Ord + Clone,
{
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

/// DashMap-backed request metrics collector.
pub struct MetricsCollector {
    config: MetricsCollectorConfig,
    total: AtomicU64,
    errors: AtomicU64,
    by_method: DashMap<String, AtomicU64>,
    by_path: DashMap<String, AtomicU64>,
    by_status: DashMap<u16, AtomicU64>,
    by_service: DashMap<String, ServiceCounters>,
    latencies: Mutex<VecDeque<u64>>,
    recent: Mutex<VecDeque<RequestMetric>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsCollectorConfig) -> Self {
        Self {
            config,
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            by_method: DashMap::new(),
            by_path: DashMap::new(),
            by_status: DashMap::new(),
            by_service: DashMap::new(),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Start the periodic prune. Stops on shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_cleanup(self: &Arc<Self>, shutdown: &ShutdownController) {
        let collector = self.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(collector.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = collector.prune(collector.config.retention);
                        if removed > 0 {
                            tracing::debug!("pruned {} request metrics", removed);
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });
    }

    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn error_requests(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Error percentage over all requests seen.
    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.error_requests() as f64 / total as f64 * 100.0
    }

    /// Average latency of the last 100 requests.
    pub fn average_latency_ms(&self) -> f64 {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return 0.0;
        }
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    }

    /// Requests seen in the last minute, per second.
    pub fn requests_per_second(&self) -> f64 {
        let cutoff = now_millis().saturating_sub(60_000);
        let recent = self.recent.lock();
        let count = recent.iter().rev().take_while(|m| m.timestamp_ms >= cutoff).count();
        count as f64 / 60.0
    }

    /// Traffic-derived health of a service. No traffic reads as healthy.
    pub fn service_health(&self, service: &str) -> HealthLevel {
        self.by_service
            .get(service)
            .map(|c| Self::traffic_health(&c))
            .unwrap_or(HealthLevel::Healthy)
    }

    fn traffic_health(counters: &ServiceCounters) -> HealthLevel {
        let total = counters.total.load(Ordering::Relaxed);
        if total == 0 {
            return HealthLevel::Healthy;
        }
        let errors = counters.errors.load(Ordering::Relaxed);
        HealthLevel::from_ratio((total - errors.min(total)) as f64 / total as f64)
    }

    /// Drop request records older than `retention`. Counters are kept.
    pub fn prune(&self, retention: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(retention.as_millis() as u64);
        let mut recent = self.recent.lock();
        let before = recent.len();
        recent.retain(|m| m.timestamp_ms >= cutoff);
        before - recent.len()
    }

    pub fn summary(&self) -> MetricsSummary {
        let total = self.total_requests();
        let errors = self.error_requests();
        MetricsSummary {
            total_requests: total,
            successful_requests: total.saturating_sub(errors),
            error_requests: errors,
            error_rate: self.error_rate(),
            average_latency_ms: self.average_latency_ms(),
            requests_per_second: self.requests_per_second(),
            by_method: collect(&self.by_method),
            by_path: collect(&self.by_path),
            by_status: collect(&self.by_status),
            by_service: self
                .by_service
                .iter()
                .map(|e| {
                    (
                        e.key().clone(),
                        ServiceTraffic {
                            total_requests: e.value().total.load(Ordering::Relaxed),
                            error_requests: e.value().errors.load(Ordering::Relaxed),
                            health: Self::traffic_health(e.value()),
                        },
                    )
                })
                .collect(),
            retained_requests: self.recent.lock().len(),
        }
    }

    /// Clear everything.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.by_method.clear();
        self.by_path.clear();
        self.by_status.clear();
        self.by_service.clear();
        self.latencies.lock().clear();
        self.recent.lock().clear();
        tracing::info!("request metrics reset");
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsCollectorConfig::default())
    }
}

impl MetricsSink for MetricsCollector {
    fn record(&self, metric: RequestMetric) {
        let is_error = metric.is_error();

        self.total.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        bump_capped(&self.by_method, &metric.method, MAX_BREAKDOWN_KEYS);
        bump_capped(&self.by_path, &metric.path, MAX_BREAKDOWN_KEYS);
        bump(&self.by_status, metric.status_code);
        {
            let service = self.by_service.entry(metric.service.clone()).or_default();
            service.total.fetch_add(1, Ordering::Relaxed);
            if is_error {
                service.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let mut latencies = self.latencies.lock();
            if latencies.len() == LATENCY_WINDOW {
                latencies.pop_front();
            }
            latencies.push_back(metric.latency_ms);
        }

        let mut recent = self.recent.lock();
        if recent.len() == MAX_RETAINED {
            recent.pop_front();
        }
        recent.push_back(metric);
    }
}
