use crate::adapters::outbound::MetricsCollectorConfig;
use crate::application::{LoadBalancerConfig, RegistryConfig, Route, RouteTable};
use crate::domain::entities::InstanceConfig;
use crate::domain::value_objects::LoadBalancingStrategy;
use crate::infrastructure::circuit_breaker::{BreakerScope, CircuitBreakerConfig};
use crate::infrastructure::health_monitor::HealthMonitorConfig;
use crate::infrastructure::system_metrics::ResourceThresholds;
use std::net::SocketAddr;
use std::time::Duration;

/// A backend instance registered at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticInstance {
    pub service: String,
    pub host: String,
    pub port: u16,
}

impl StaticInstance {
    pub fn instance_config(&self) -> InstanceConfig {
        InstanceConfig::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Listeners
    pub listen_addr: String,
    pub admin_listen_addr: String,
    pub debug: bool,

    // Circuit breaker
    pub breaker_timeout_ms: u64,
    pub breaker_error_threshold: f64,
    pub breaker_reset_timeout_secs: u64,
    pub breaker_monitoring_period_secs: u64,
    pub breaker_minimum_requests: u32,
    pub breaker_scope: BreakerScope,

    // Load balancer
    pub lb_strategy: LoadBalancingStrategy,
    pub lb_max_retries: u32,
    pub lb_retry_delay_ms: u64,
    pub lb_timeout_secs: u64,

    // Health monitor
    pub health_check_interval_secs: u64,
    pub health_response_time_threshold_ms: u64,
    pub memory_threshold: f64,
    pub cpu_threshold: f64,
    pub disk_threshold: f64,

    // Registry probing
    pub registry_check_interval_secs: u64,
    pub registry_check_timeout_secs: u64,
    pub registry_retry_attempts: u32,

    // Metrics
    pub metrics_retention_secs: u64,
    pub metrics_cleanup_interval_secs: u64,

    // Routing
    pub routes: Vec<Route>,
    pub instances: Vec<StaticInstance>,
    pub auth_verify_url: Option<String>,
    pub auth_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            admin_listen_addr: "0.0.0.0:8081".to_string(),
            debug: false,
            breaker_timeout_ms: 5000,
            breaker_error_threshold: 50.0,
            breaker_reset_timeout_secs: 30,
            breaker_monitoring_period_secs: 10,
            breaker_minimum_requests: 5,
            breaker_scope: BreakerScope::Service,
            lb_strategy: LoadBalancingStrategy::RoundRobin,
            lb_max_retries: 3,
            lb_retry_delay_ms: 100,
            lb_timeout_secs: 30,
            health_check_interval_secs: 30,
            health_response_time_threshold_ms: 1000,
            memory_threshold: 85.0,
            cpu_threshold: 80.0,
            disk_threshold: 90.0,
            registry_check_interval_secs: 30,
            registry_check_timeout_secs: 5,
            registry_retry_attempts: 3,
            metrics_retention_secs: 3600,
            metrics_cleanup_interval_secs: 300,
            routes: default_routes(),
            instances: Vec::new(),
            auth_verify_url: None,
            auth_timeout_ms: 5000,
            shutdown_grace_secs: 10,
        }
    }
}

/// The stock route table: `/api/auth` is public, everything else needs a
/// verified caller.
pub fn default_routes() -> Vec<Route> {
    vec![
        Route::new("/api/auth", "auth-service"),
        Route::new("/api/chat", "chat-service").with_auth(),
        Route::new("/api/analytics", "analytics-service").with_auth(),
        Route::new("/api/users", "user-service").with_auth(),
        Route::new("/api/notifications", "notification-service").with_auth(),
        Route::new("/api/files", "file-service").with_auth(),
    ]
}

impl Config {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout: Duration::from_millis(self.breaker_timeout_ms),
            error_threshold_percentage: self.breaker_error_threshold,
            reset_timeout: Duration::from_secs(self.breaker_reset_timeout_secs),
            monitoring_period: Duration::from_secs(self.breaker_monitoring_period_secs),
            minimum_requests: self.breaker_minimum_requests,
        }
    }

    pub fn load_balancer_config(&self) -> LoadBalancerConfig {
        LoadBalancerConfig {
            strategy: self.lb_strategy,
            max_retries: self.lb_max_retries,
            retry_delay: Duration::from_millis(self.lb_retry_delay_ms),
            timeout: Duration::from_secs(self.lb_timeout_secs),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            health_check_interval: Duration::from_secs(self.registry_check_interval_secs),
            health_check_timeout: Duration::from_secs(self.registry_check_timeout_secs),
            retry_attempts: self.registry_retry_attempts,
            ..RegistryConfig::default()
        }
    }

    /// Resource sampling settings. Probe cadence and timeout are read from
    /// the registry section.
    pub fn health_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            check_interval: Duration::from_secs(self.health_check_interval_secs),
            response_time_threshold: Duration::from_millis(self.health_response_time_threshold_ms),
            thresholds: ResourceThresholds {
                memory_percent: self.memory_threshold,
                cpu_percent: self.cpu_threshold,
                disk_percent: self.disk_threshold,
            },
            ..HealthMonitorConfig::default()
        }
    }

    pub fn metrics_config(&self) -> MetricsCollectorConfig {
        MetricsCollectorConfig {
            retention: Duration::from_secs(self.metrics_retention_secs),
            cleanup_interval: Duration::from_secs(self.metrics_cleanup_interval_secs),
        }
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::new(self.routes.clone())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for addr in [&self.listen_addr, &self.admin_listen_addr] {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::InvalidAddress(addr.clone()));
            }
        }
        if self.listen_addr == self.admin_listen_addr {
            return Err(ConfigError::SharedListener(self.listen_addr.clone()));
        }

        let thresholds = [
            ("breaker_error_threshold", self.breaker_error_threshold),
            ("memory_threshold", self.memory_threshold),
            ("cpu_threshold", self.cpu_threshold),
            ("disk_threshold", self.disk_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::PercentageOutOfRange { name, value });
            }
        }

        if self.lb_max_retries == 0 {
            return Err(ConfigError::ZeroValue("lb_max_retries"));
        }
        if self.registry_retry_attempts == 0 {
            return Err(ConfigError::ZeroValue("registry_retry_attempts"));
        }
        let intervals = [
            ("breaker_timeout_ms", self.breaker_timeout_ms),
            ("breaker_monitoring_period_secs", self.breaker_monitoring_period_secs),
            ("lb_timeout_secs", self.lb_timeout_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("registry_check_interval_secs", self.registry_check_interval_secs),
            ("registry_check_timeout_secs", self.registry_check_timeout_secs),
            ("metrics_cleanup_interval_secs", self.metrics_cleanup_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.prefix.as_str()) {
                return Err(ConfigError::DuplicateRoute(route.prefix.clone()));
            }
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
    #[error("gateway and admin listeners share {0}")]
    SharedListener(String),
    #[error("{name} must be between 0 and 100, got {value}")]
    PercentageOutOfRange { name: &'static str, value: f64 },
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("no routes configured")]
    NoRoutes,
    #[error("duplicate route prefix: {0}")]
    DuplicateRoute(String),
    #[error("invalid route entry '{0}', expected prefix=service[:auth]")]
    InvalidRoute(String),
    #[error("invalid instance entry '{0}', expected service=host:port")]
    InvalidInstance(String),
    #[error("unknown load balancing strategy: {0}")]
    UnknownStrategy(String),
}

/// Parse `GATEWAY_ROUTES`: comma-separated `prefix=service[:auth]`.
pub fn parse_routes(raw: &str) -> Result<Vec<Route>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (prefix, target) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidRoute(entry.to_string()))?;
            let (service, auth) = match target.split_once(':') {
                Some((service, "auth")) => (service, true),
                Some(_) => return Err(ConfigError::InvalidRoute(entry.to_string())),
                None => (target, false),
            };
            let (prefix, service) = (prefix.trim(), service.trim());
            if !prefix.starts_with('/') || service.is_empty() {
                return Err(ConfigError::InvalidRoute(entry.to_string()));
            }
            let route = Route::new(prefix, service);
            Ok(if auth { route.with_auth() } else { route })
        })
        .collect()
}

/// Parse `GATEWAY_INSTANCES`: comma-separated `service=host:port`.
pub fn parse_instances(raw: &str) -> Result<Vec<StaticInstance>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidInstance(entry.to_string());
            let (service, addr) = entry.split_once('=').ok_or_else(invalid)?;
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            let port: u16 = port.trim().parse().map_err(|_| invalid())?;
            let (service, host) = (service.trim(), host.trim());
            if service.is_empty() || host.is_empty() || port == 0 {
                return Err(invalid());
            }
            Ok(StaticInstance {
                service: service.to_string(),
                host: host.to_string(),
                port,
            })
        })
        .collect()
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let listen_addr = std::env::var("GATEWAY_LISTEN_ADDR")
        .unwrap_or_else(|_| defaults.listen_addr.clone());

    let admin_listen_addr = std::env::var("GATEWAY_ADMIN_LISTEN_ADDR")
        .unwrap_or_else(|_| defaults.admin_listen_addr.clone());

    let debug = std::env::var("DEBUG").is_ok();

    // Circuit breaker
    let breaker_scope = std::env::var("GATEWAY_BREAKER_SCOPE")
        .map(|v| BreakerScope::from_str(&v))
        .unwrap_or(defaults.breaker_scope);

    // Load balancer
    let lb_strategy = match std::env::var("GATEWAY_LB_STRATEGY") {
        Ok(v) => LoadBalancingStrategy::parse(&v).ok_or(ConfigError::UnknownStrategy(v))?,
        Err(_) => defaults.lb_strategy,
    };

    // Routing
    let routes = match std::env::var("GATEWAY_ROUTES") {
        Ok(v) => parse_routes(&v)?,
        Err(_) => defaults.routes.clone(),
    };

    let instances = match std::env::var("GATEWAY_INSTANCES") {
        Ok(v) => parse_instances(&v)?,
        Err(_) => Vec::new(),
    };

    let auth_verify_url = std::env::var("GATEWAY_AUTH_VERIFY_URL")
        .ok()
        .filter(|v| !v.trim().is_empty());

    let config = Config {
        listen_addr,
        admin_listen_addr,
        debug,
        breaker_timeout_ms: env_or("GATEWAY_BREAKER_TIMEOUT_MS", defaults.breaker_timeout_ms),
        breaker_error_threshold: env_or(
            "GATEWAY_BREAKER_ERROR_THRESHOLD",
            defaults.breaker_error_threshold,
        ),
        breaker_reset_timeout_secs: env_or(
            "GATEWAY_BREAKER_RESET_TIMEOUT_SECS",
            defaults.breaker_reset_timeout_secs,
        ),
        breaker_monitoring_period_secs: env_or(
            "GATEWAY_BREAKER_MONITORING_PERIOD_SECS",
            defaults.breaker_monitoring_period_secs,
        ),
        breaker_minimum_requests: env_or(
            "GATEWAY_BREAKER_MINIMUM_REQUESTS",
            defaults.breaker_minimum_requests,
        ),
        breaker_scope,
        lb_strategy,
        lb_max_retries: env_or("GATEWAY_LB_MAX_RETRIES", defaults.lb_max_retries),
        lb_retry_delay_ms: env_or("GATEWAY_LB_RETRY_DELAY_MS", defaults.lb_retry_delay_ms),
        lb_timeout_secs: env_or("GATEWAY_LB_TIMEOUT_SECS", defaults.lb_timeout_secs),
        health_check_interval_secs: env_or(
            "GATEWAY_HEALTH_CHECK_INTERVAL_SECS",
            defaults.health_check_interval_secs,
        ),
        health_response_time_threshold_ms: env_or(
            "GATEWAY_HEALTH_RESPONSE_TIME_THRESHOLD_MS",
            defaults.health_response_time_threshold_ms,
        ),
        memory_threshold: env_or("GATEWAY_MEMORY_THRESHOLD", defaults.memory_threshold),
        cpu_threshold: env_or("GATEWAY_CPU_THRESHOLD", defaults.cpu_threshold),
        disk_threshold: env_or("GATEWAY_DISK_THRESHOLD", defaults.disk_threshold),
        registry_check_interval_secs: env_or(
            "GATEWAY_REGISTRY_CHECK_INTERVAL_SECS",
            defaults.registry_check_interval_secs,
        ),
        registry_check_timeout_secs: env_or(
            "GATEWAY_REGISTRY_CHECK_TIMEOUT_SECS",
            defaults.registry_check_timeout_secs,
        ),
        registry_retry_attempts: env_or(
            "GATEWAY_REGISTRY_RETRY_ATTEMPTS",
            defaults.registry_retry_attempts,
        ),
        metrics_retention_secs: env_or(
            "GATEWAY_METRICS_RETENTION_SECS",
            defaults.metrics_retention_secs,
        ),
        metrics_cleanup_interval_secs: env_or(
            "GATEWAY_METRICS_CLEANUP_INTERVAL_SECS",
            defaults.metrics_cleanup_interval_secs,
        ),
        routes,
        instances,
        auth_verify_url,
        auth_timeout_ms: env_or("GATEWAY_AUTH_TIMEOUT_MS", defaults.auth_timeout_ms),
        shutdown_grace_secs: env_or("GATEWAY_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs),
    };

    config.validate()?;
    Ok(config)
}
