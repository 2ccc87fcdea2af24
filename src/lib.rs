//! service-gateway Library
//!
//! Control plane of an HTTP API gateway: service registry, load balancer,
//! circuit breakers, health monitor, metrics collector and the routing core
//! that ties them together. Exposed as a library for integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{GatewayService, LoadBalancerService, ServiceRegistry};
pub use config::{load_config, Config};
pub use domain::entities::{InstanceConfig, ServiceInstance};
pub use domain::ports::{Authenticator, HealthProbe, MetricsSink, UpstreamClient};
pub use domain::value_objects::{InstanceStatus, LoadBalancingStrategy};
pub use error::{GatewayError, GatewayResult};
pub use infrastructure::{BreakerManager, HealthMonitor, ShutdownController};
