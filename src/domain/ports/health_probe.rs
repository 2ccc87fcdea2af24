//! Health Probe Port

use crate::domain::entities::{InstanceSnapshot, ProbeResult};
use async_trait::async_trait;
use std::time::Duration;

/// Liveness probe against an instance's health endpoint.
///
/// Probes never fail outward: transport errors and timeouts come back as
/// an unhealthy `ProbeResult`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &InstanceSnapshot, timeout: Duration) -> ProbeResult;
}
