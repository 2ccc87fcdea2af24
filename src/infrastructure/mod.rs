//! Infrastructure Layer
//!
//! Fault isolation, health monitoring and process lifecycle.

pub mod circuit_breaker;
pub mod health_monitor;
pub mod shutdown;
pub mod system_metrics;

pub use circuit_breaker::{
    BreakerManager, BreakerScope, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use health_monitor::{CheckRound, HealthMonitor, HealthMonitorConfig, HealthSummary, InstanceHealth};
pub use shutdown::{shutdown_signal, InFlightGuard, ShutdownController};
pub use system_metrics::{ResourceThresholds, ResourceUsage, SystemSampler};
