//! Application Layer
//!
//! Use cases built on domain types and ports: the service registry, the
//! load balancer service and the routing core.

pub mod gateway_service;
pub mod load_balancer;
pub mod service_registry;

pub use gateway_service::{GatewayRequest, GatewayResponse, GatewayService, Route, RouteTable};
pub use load_balancer::{LoadBalancerConfig, LoadBalancerService, LoadBalancerStats};
pub use service_registry::{RegistryConfig, ServiceRegistry};
