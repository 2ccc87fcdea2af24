//! Service Registry
//!
//! Central in-memory catalog of backend instances, keyed by logical
//! service name. The catalog map has its own lock; each instance carries
//! its own lock for status, so probes and traffic on different backends
//! never contend.

use crate::domain::entities::{
    HealthCheckRecord, InstanceConfig, InstanceSnapshot, ProbeResult, ServiceInstance,
    StatusTransition,
};
use crate::domain::events::RegistryEvent;
use crate::domain::ports::HealthProbe;
use crate::domain::value_objects::InstanceStatus;
use crate::error::{GatewayError, GatewayResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Consecutive call failures after which the load balancer's feedback
/// marks an instance unhealthy.
pub const CALL_FAILURES_BEFORE_UNHEALTHY: u32 = 3;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between probe rounds
    pub health_check_interval: Duration,
    /// Timeout for each probe
    pub health_check_timeout: Duration,
    /// Consecutive probe failures before an instance is quarantined
    pub retry_attempts: u32,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            event_capacity: 256,
        }
    }
}

/// In-memory service registry.
pub struct ServiceRegistry {
    config: RegistryConfig,
    /// Service name -> instances in registration order
    services: RwLock<BTreeMap<String, Vec<Arc<ServiceInstance>>>>,
    prober: Option<Arc<dyn HealthProbe>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    /// Create a registry without a prober; instances stay `unknown` until
    /// a probe result is applied.
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            services: RwLock::new(BTreeMap::new()),
            prober: None,
            events,
        }
    }

    /// Attach the prober used for the immediate probe on registration.
    pub fn with_prober(mut self, prober: Arc<dyn HealthProbe>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register an instance and probe it once.
    ///
    /// Registering the same host and port again replaces the old record.
    pub async fn register(&self, name: &str, config: InstanceConfig) -> GatewayResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::InvalidConfig("service name is required".into()));
        }
        config.validate()?;

        let instance = Arc::new(ServiceInstance::new(name, config));
        let id = instance.id.clone();

        {
            let mut services = self.services.write();
            let list = services.entry(name.to_string()).or_default();
            match list.iter().position(|i| i.id == id) {
                Some(pos) => list[pos] = instance.clone(),
                None => list.push(instance.clone()),
            }
        }

        tracing::info!("registered instance {} at {}", id, instance.base_url());
        self.emit(RegistryEvent::Registered {
            instance_id: id.clone(),
            service: name.to_string(),
        });

        if let Some(prober) = &self.prober {
            let result = prober
                .probe(&instance.snapshot(), self.config.health_check_timeout)
                .await;
            self.apply_probe(&instance, &result);
        }

        Ok(id)
    }

    /// Remove an instance.
    pub fn deregister(&self, instance_id: &str) -> bool {
        let removed = {
            let mut services = self.services.write();
            let mut removed = None;
            for (name, list) in services.iter_mut() {
                if let Some(pos) = list.iter().position(|i| i.id == instance_id) {
                    removed = Some((name.clone(), list.remove(pos)));
                    break;
                }
            }
            if let Some((name, _)) = &removed {
                if services.get(name).map(|l| l.is_empty()).unwrap_or(false) {
                    services.remove(name);
                }
            }
            removed
        };

        match removed {
            Some((service, instance)) => {
                tracing::info!("deregistered instance {}", instance.id);
                self.emit(RegistryEvent::Deregistered {
                    instance_id: instance.id.clone(),
                    service,
                });
                true
            }
            None => false,
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.services
            .read()
            .values()
            .flat_map(|list| list.iter())
            .find(|i| i.id == instance_id)
            .cloned()
    }

    /// All instances of a service in registration order.
    pub fn instances_of(&self, service: &str) -> Vec<Arc<ServiceInstance>> {
        self.services
            .read()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Every registered instance.
    pub fn all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.services
            .read()
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    /// Selectable instances of a service.
    pub fn healthy_instances(&self, service: &str) -> Vec<Arc<ServiceInstance>> {
        self.instances_of(service)
            .into_iter()
            .filter(|i| i.status().is_selectable())
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scoped(&self, service: Option<&str>) -> Vec<Arc<ServiceInstance>> {
        match service {
            Some(name) => self.instances_of(name),
            None => self.all_instances(),
        }
    }

    /// Healthy instances, optionally restricted to one service.
    pub fn get_healthy(&self, service: Option<&str>) -> Vec<InstanceSnapshot> {
        self.scoped(service)
            .iter()
            .map(|i| i.snapshot())
            .filter(|s| s.status.is_selectable())
            .collect()
    }

    /// Unhealthy and quarantined instances, optionally restricted to one
    /// service.
    pub fn get_unhealthy(&self, service: Option<&str>) -> Vec<InstanceSnapshot> {
        self.scoped(service)
            .iter()
            .map(|i| i.snapshot())
            .filter(|s| s.status.is_down())
            .collect()
    }

    pub fn get_all(&self) -> Vec<InstanceSnapshot> {
        self.all_instances().iter().map(|i| i.snapshot()).collect()
    }

    /// Apply a probe result to an instance.
    ///
    /// Emits `StatusChanged` only when the status differs from before.
    pub fn update_health(
        &self,
        instance_id: &str,
        result: &ProbeResult,
    ) -> GatewayResult<Option<StatusTransition>> {
        let instance = self
            .get(instance_id)
            .ok_or_else(|| GatewayError::UnknownInstance(instance_id.to_string()))?;
        Ok(self.apply_probe(&instance, result))
    }

    fn apply_probe(&self, instance: &ServiceInstance, result: &ProbeResult) -> Option<StatusTransition> {
        let transition = instance.apply_probe(result, self.config.retry_attempts);

        if let Some(error) = &result.error {
            tracing::warn!(
                "health probe failed for {} ({} consecutive): {}",
                instance.id,
                instance.consecutive_failures(),
                error
            );
        }

        if let Some(t) = &transition {
            match t.to {
                InstanceStatus::Failed => tracing::warn!(
                    "instance {} quarantined after {} failed probes",
                    t.instance_id,
                    self.config.retry_attempts
                ),
                _ => tracing::info!("instance {} is now {} (was {})", t.instance_id, t.to, t.from),
            }
            self.emit(RegistryEvent::StatusChanged(t.clone()));
        }

        transition
    }

    /// Load balancer feedback for a successful call.
    pub fn report_success(&self, instance: &ServiceInstance, latency: Duration) {
        instance.record_success(latency);
    }

    /// Load balancer feedback for a failed call.
    ///
    /// Marks the instance unhealthy after
    /// `CALL_FAILURES_BEFORE_UNHEALTHY` consecutive failures.
    pub fn report_failure(&self, instance: &ServiceInstance) -> Option<StatusTransition> {
        let transition = instance.record_failure(CALL_FAILURES_BEFORE_UNHEALTHY);
        if let Some(t) = &transition {
            tracing::warn!(
                "instance {} marked {} after {} consecutive call failures",
                t.instance_id,
                t.to,
                CALL_FAILURES_BEFORE_UNHEALTHY
            );
            self.emit(RegistryEvent::CallFeedback(t.clone()));
        }
        transition
    }

    /// Combined feedback entry point used by the load balancer.
    pub fn record_call_outcome(
        &self,
        instance: &ServiceInstance,
        success: bool,
        latency: Duration,
    ) -> Option<StatusTransition> {
        if success {
            self.report_success(instance, latency);
            None
        } else {
            self.report_failure(instance)
        }
    }

    /// Operator reactivation of a quarantined instance.
    ///
    /// Resets it to `unknown` and probes it again right away.
    pub async fn reactivate(&self, instance_id: &str) -> GatewayResult<InstanceStatus> {
        let instance = self
            .get(instance_id)
            .ok_or_else(|| GatewayError::UnknownInstance(instance_id.to_string()))?;

        if let Some(t) = instance.reset() {
            tracing::info!("instance {} reactivated (was {})", t.instance_id, t.from);
            self.emit(RegistryEvent::StatusChanged(t));
        }

        if let Some(prober) = &self.prober {
            let result = prober
                .probe(&instance.snapshot(), self.config.health_check_timeout)
                .await;
            self.apply_probe(&instance, &result);
        }

        Ok(instance.status())
    }

    /// Probe history of an instance, oldest first.
    pub fn history(&self, instance_id: &str) -> GatewayResult<Vec<HealthCheckRecord>> {
        self.get(instance_id)
            .map(|i| i.history())
            .ok_or_else(|| GatewayError::UnknownInstance(instance_id.to_string()))
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
