//! Domain Entities
//!
//! Entities have identity and mutable runtime state. A `ServiceInstance`
//! guards its status fields with its own lock and keeps hot counters in
//! atomics, so traffic to one backend never serialises behind another.

use crate::domain::value_objects::{InstanceStatus, Protocol};
use crate::error::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Probe history entries kept per instance.
pub const HEALTH_HISTORY_LIMIT: usize = 50;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Registration payload for one backend instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix prepended to forwarded requests
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_health_endpoint", alias = "healthEndpoint")]
    pub health_endpoint: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections", alias = "maxConnections")]
    pub max_connections: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_path() -> String {
    "/".to_string()
}
fn default_health_endpoint() -> String {
    "/health".to_string()
}
fn default_weight() -> u32 {
    1
}
fn default_max_connections() -> u32 {
    100
}
fn default_version() -> String {
    "1.0.0".to_string()
}

impl InstanceConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: default_path(),
            health_endpoint: default_health_endpoint(),
            protocol: Protocol::Http,
            weight: default_weight(),
            max_connections: default_max_connections(),
            metadata: HashMap::new(),
            version: default_version(),
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn health_endpoint(mut self, path: impl Into<String>) -> Self {
        self.health_endpoint = path.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate the registration payload.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.host.trim().is_empty() {
            return Err(GatewayError::InvalidConfig("host is required".into()));
        }
        if self.port == 0 {
            return Err(GatewayError::InvalidConfig("port must be non-zero".into()));
        }
        if self.weight == 0 {
            return Err(GatewayError::InvalidConfig("weight must be at least 1".into()));
        }
        if !self.health_endpoint.starts_with('/') {
            return Err(GatewayError::InvalidConfig(
                "health endpoint must start with '/'".into(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(GatewayError::InvalidConfig("path must start with '/'".into()));
        }
        Ok(())
    }
}

/// Status change of one instance, emitted at most once per real transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub instance_id: String,
    pub service: String,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

/// Outcome of one health probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
    pub checked_at_ms: u64,
}

impl ProbeResult {
    pub fn success(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
            checked_at_ms: now_millis(),
        }
    }

    pub fn failure(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
            checked_at_ms: now_millis(),
        }
    }
}

/// One entry of an instance's probe history.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckRecord {
    pub timestamp_ms: u64,
    pub status: InstanceStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// One completed request as seen by the routing core.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    pub timestamp_ms: u64,
    pub method: String,
    pub path: String,
    pub service: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub correlation_id: Option<String>,
}

impl RequestMetric {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        service: impl Into<String>,
        status_code: u16,
        latency: Duration,
    ) -> Self {
        Self {
            timestamp_ms: now_millis(),
            method: method.into(),
            path: path.into(),
            service: service.into(),
            status_code,
            latency_ms: latency.as_millis() as u64,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

#[derive(Debug)]
struct InstanceState {
    status: InstanceStatus,
    consecutive_failures: u32,
    last_check_ms: Option<u64>,
    last_latency: Option<Duration>,
    history: VecDeque<HealthCheckRecord>,
}

/// One running backend process.
#[derive(Debug)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub config: InstanceConfig,
    pub registered_at_ms: u64,
    state: Mutex<InstanceState>,
    current_connections: AtomicUsize,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl ServiceInstance {
    /// Create an instance in `unknown` status.
    pub fn new(service: impl Into<String>, config: InstanceConfig) -> Self {
        let service = service.into();
        Self {
            id: Self::make_id(&service, &config.host, config.port),
            service,
            config,
            registered_at_ms: now_millis(),
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Unknown,
                consecutive_failures: 0,
                last_check_ms: None,
                last_latency: None,
                history: VecDeque::with_capacity(HEALTH_HISTORY_LIMIT),
            }),
            current_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    /// Composite identity: service name + host + port.
    pub fn make_id(service: &str, host: &str, port: u16) -> String {
        format!("{}:{}:{}", service, host, port)
    }

    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.config.protocol, self.config.host, self.config.port
        )
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.config.health_endpoint)
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.lock().status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.state.lock().last_latency
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Failed / total request ratio, 0 without traffic.
    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.failed_requests() as f64 / total as f64
    }

    /// Apply one probe result.
    ///
    /// Success marks the instance healthy and clears the failure streak.
    /// Failure extends the streak and marks it unhealthy, or `failed` once
    /// the streak reaches `retry_attempts`. Returns the transition if the
    /// status actually changed.
    pub fn apply_probe(&self, result: &ProbeResult, retry_attempts: u32) -> Option<StatusTransition> {
        let mut state = self.state.lock();
        let from = state.status;

        state.last_check_ms = Some(result.checked_at_ms);
        state.last_latency = Some(result.latency);

        let to = if result.healthy {
            state.consecutive_failures = 0;
            InstanceStatus::Healthy
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if state.consecutive_failures >= retry_attempts.max(1) {
                InstanceStatus::Failed
            } else {
                InstanceStatus::Unhealthy
            }
        };
        state.status = to;

        if state.history.len() == HEALTH_HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(HealthCheckRecord {
            timestamp_ms: result.checked_at_ms,
            status: to,
            latency_ms: result.latency.as_millis() as u64,
            error: result.error.clone(),
        });

        self.transition(from, to)
    }

    /// Probe history, oldest first.
    pub fn history(&self) -> Vec<HealthCheckRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Count a request start. Pair with `end_request` or use `acquire`.
    pub fn begin_request(&self) {
        self.current_connections.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one active connection, saturating at zero.
    pub fn end_request(&self) {
        let mut current = self.current_connections.load(Ordering::SeqCst);
        while current > 0 {
            match self.current_connections.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    /// Take a scoped connection slot, released when the lease drops.
    pub fn acquire(self: &Arc<Self>) -> ConnectionLease {
        self.begin_request();
        ConnectionLease {
            instance: self.clone(),
        }
    }

    /// Successful call: clears the failure streak and records latency.
    pub fn record_success(&self, latency: Duration) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.last_latency = Some(latency);
    }

    /// Failed call. Marks the instance unhealthy once the failure streak
    /// reaches `unhealthy_after`; quarantined instances stay failed.
    pub fn record_failure(&self, unhealthy_after: u32) -> Option<StatusTransition> {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let from = state.status;
        if state.consecutive_failures >= unhealthy_after && !from.is_down() {
            state.status = InstanceStatus::Unhealthy;
        }
        let to = state.status;
        self.transition(from, to)
    }

    /// Operator reset of a quarantined instance back to `unknown`.
    pub fn reset(&self) -> Option<StatusTransition> {
        let mut state = self.state.lock();
        let from = state.status;
        state.status = InstanceStatus::Unknown;
        state.consecutive_failures = 0;
        self.transition(from, InstanceStatus::Unknown)
    }

    fn transition(&self, from: InstanceStatus, to: InstanceStatus) -> Option<StatusTransition> {
        (from != to).then(|| StatusTransition {
            instance_id: self.id.clone(),
            service: self.service.clone(),
            from,
            to,
        })
    }

    /// Consistent point-in-time view of the instance.
    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock();
        InstanceSnapshot {
            id: self.id.clone(),
            service: self.service.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            protocol: self.config.protocol,
            path: self.config.path.clone(),
            health_endpoint: self.config.health_endpoint.clone(),
            weight: self.config.weight,
            max_connections: self.config.max_connections,
            metadata: self.config.metadata.clone(),
            version: self.config.version.clone(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            last_check_ms: state.last_check_ms,
            last_latency_ms: state.last_latency.map(|d| d.as_millis() as u64),
            current_connections: self.current_connections(),
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            registered_at_ms: self.registered_at_ms,
        }
    }
}

/// Scoped connection slot on an instance.
///
/// Decrements `current_connections` on drop, which covers success, failure,
/// timeout and cancellation alike.
#[derive(Debug)]
pub struct ConnectionLease {
    instance: Arc<ServiceInstance>,
}

impl ConnectionLease {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.instance.end_request();
    }
}

/// Serializable view of an instance used for selection and operator output.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub service: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub path: String,
    pub health_endpoint: String,
    pub weight: u32,
    pub max_connections: u32,
    pub metadata: HashMap<String, String>,
    pub version: String,
    pub status: InstanceStatus,
    pub consecutive_failures: u32,
    pub last_check_ms: Option<u64>,
    pub last_latency_ms: Option<u64>,
    pub current_connections: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub registered_at_ms: u64,
}

impl InstanceSnapshot {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_endpoint)
    }

    /// Full URL for a forwarded path, under the instance's path prefix.
    pub fn url_for(&self, path_and_query: &str) -> String {
        let prefix = self.path.trim_end_matches('/');
        let suffix = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };
        format!("{}{}{}", self.base_url(), prefix, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Arc<ServiceInstance> {
        Arc::new(ServiceInstance::new("orders", InstanceConfig::new("10.0.0.1", 8080)))
    }

    #[test]
    fn test_instance_id_is_composite() {
        let inst = instance();
        assert_eq!(inst.id, "orders:10.0.0.1:8080");
        assert_eq!(inst.status(), InstanceStatus::Unknown);
    }

    #[test]
    fn test_urls() {
        let inst = ServiceInstance::new(
            "files",
            InstanceConfig::new("files.local", 9443)
                .protocol(Protocol::Https)
                .health_endpoint("/ready"),
        );
        assert_eq!(inst.base_url(), "https://files.local:9443");
        assert_eq!(inst.health_url(), "https://files.local:9443/ready");

        let snap = inst.snapshot();
        assert_eq!(snap.health_url(), inst.health_url());
        assert_eq!(snap.url_for("/upload?x=1"), "https://files.local:9443/upload?x=1");
    }

    #[test]
    fn test_url_for_respects_path_prefix() {
        let snap = ServiceInstance::new("chat", InstanceConfig::new("127.0.0.1", 3002).path("/v2/"))
            .snapshot();
        assert_eq!(snap.url_for("/rooms"), "http://127.0.0.1:3002/v2/rooms");
        assert_eq!(snap.url_for("rooms"), "http://127.0.0.1:3002/v2/rooms");
    }

    #[test]
    fn test_config_validation() {
        assert!(InstanceConfig::new("h", 80).validate().is_ok());
        assert!(InstanceConfig::new("", 80).validate().is_err());
        assert!(InstanceConfig::new("h", 0).validate().is_err());
        assert!(InstanceConfig::new("h", 80).weight(0).validate().is_err());
        assert!(InstanceConfig::new("h", 80)
            .health_endpoint("health")
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let cfg: InstanceConfig =
            serde_json::from_str(r#"{"host":"127.0.0.1","port":3001,"healthEndpoint":"/ping"}"#)
                .unwrap();
        assert_eq!(cfg.weight, 1);
        assert_eq!(cfg.path, "/");
        assert_eq!(cfg.health_endpoint, "/ping");
        assert_eq!(cfg.protocol, Protocol::Http);
    }

    #[test]
    fn test_probe_success_marks_healthy() {
        let inst = instance();
        let t = inst.apply_probe(&ProbeResult::success(Duration::from_millis(5)), 3);
        let t = t.unwrap();
        assert_eq!(t.from, InstanceStatus::Unknown);
        assert_eq!(t.to, InstanceStatus::Healthy);
        assert_eq!(inst.last_latency(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_probe_failures_escalate_to_failed() {
        let inst = instance();
        let fail = ProbeResult::failure("refused", Duration::from_millis(1));

        let t1 = inst.apply_probe(&fail, 3).unwrap();
        assert_eq!(t1.to, InstanceStatus::Unhealthy);

        // Same status again: no transition
        assert!(inst.apply_probe(&fail, 3).is_none());

        let t3 = inst.apply_probe(&fail, 3).unwrap();
        assert_eq!(t3.from, InstanceStatus::Unhealthy);
        assert_eq!(t3.to, InstanceStatus::Failed);
        assert_eq!(inst.consecutive_failures(), 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let inst = instance();
        for i in 0..(HEALTH_HISTORY_LIMIT + 10) {
            let result = if i % 2 == 0 {
                ProbeResult::success(Duration::from_millis(i as u64))
            } else {
                ProbeResult::failure("flap", Duration::from_millis(i as u64))
            };
            inst.apply_probe(&result, 100);
        }
        let history = inst.history();
        assert_eq!(history.len(), HEALTH_HISTORY_LIMIT);
        // Oldest entries were evicted
        assert_eq!(history[0].latency_ms, 10);
        assert_eq!(history.last().unwrap().error.as_deref(), Some("flap"));
    }

    #[test]
    fn test_record_failure_marks_unhealthy_after_threshold() {
        let inst = instance();
        inst.apply_probe(&ProbeResult::success(Duration::ZERO), 3);

        assert!(inst.record_failure(3).is_none());
        assert!(inst.record_failure(3).is_none());
        let t = inst.record_failure(3).unwrap();
        assert_eq!(t.to, InstanceStatus::Unhealthy);
        assert_eq!(inst.failed_requests(), 3);
    }

    #[test]
    fn test_record_failure_keeps_failed() {
        let inst = instance();
        let fail = ProbeResult::failure("x", Duration::ZERO);
        inst.apply_probe(&fail, 1);
        assert_eq!(inst.status(), InstanceStatus::Failed);
        assert!(inst.record_failure(1).is_none());
        assert_eq!(inst.status(), InstanceStatus::Failed);
    }

    #[test]
    fn test_record_success_resets_streak() {
        let inst = instance();
        inst.record_failure(10);
        inst.record_failure(10);
        inst.record_success(Duration::from_millis(7));
        assert_eq!(inst.consecutive_failures(), 0);
        assert_eq!(inst.successful_requests(), 1);
        assert_eq!(inst.last_latency(), Some(Duration::from_millis(7)));
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let inst = instance();
        {
            let _a = inst.acquire();
            let _b = inst.acquire();
            assert_eq!(inst.current_connections(), 2);
        }
        assert_eq!(inst.current_connections(), 0);
        assert_eq!(inst.total_requests(), 2);
    }

    #[test]
    fn test_end_request_saturates() {
        let inst = instance();
        inst.end_request();
        assert_eq!(inst.current_connections(), 0);
    }

    #[test]
    fn test_reset_returns_to_unknown() {
        let inst = instance();
        inst.apply_probe(&ProbeResult::failure("x", Duration::ZERO), 1);
        let t = inst.reset().unwrap();
        assert_eq!(t.from, InstanceStatus::Failed);
        assert_eq!(t.to, InstanceStatus::Unknown);
        assert_eq!(inst.consecutive_failures(), 0);
    }

    #[test]
    fn test_error_rate() {
        let inst = instance();
        assert_eq!(inst.error_rate(), 0.0);
        for _ in 0..4 {
            let _lease = inst.acquire();
        }
        inst.record_failure(100);
        assert!((inst.error_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let inst = instance();
        inst.apply_probe(&ProbeResult::success(Duration::from_millis(12)), 3);
        let _lease = inst.acquire();
        let snap = inst.snapshot();
        assert_eq!(snap.status, InstanceStatus::Healthy);
        assert_eq!(snap.current_connections, 1);
        assert_eq!(snap.last_latency_ms, Some(12));
        assert!(snap.last_check_ms.is_some());
    }
}
