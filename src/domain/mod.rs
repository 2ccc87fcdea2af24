//! Domain Layer
//!
//! Entities, value objects, events, ports and pure services. Nothing in
//! here performs I/O.

pub mod entities;
pub mod events;
pub mod ports;
pub mod services;
pub mod value_objects;

pub use entities::{
    ConnectionLease, HealthCheckRecord, InstanceConfig, InstanceSnapshot, ProbeResult, RequestMetric,
    ServiceInstance, StatusTransition,
};
pub use events::{HealthEvent, RegistryEvent};
pub use value_objects::{HealthLevel, InstanceStatus, LoadBalancingStrategy, Protocol};
