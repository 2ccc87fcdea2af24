//! Health Monitor
//!
//! Periodically probes every registered instance, feeds the results into
//! the registry and scores instance and gateway health. A second loop
//! samples host resources. Probe cadence and timeout come from the
//! registry's configuration.

use crate::application::service_registry::ServiceRegistry;
use crate::domain::entities::{now_millis, HealthCheckRecord, ProbeResult, ServiceInstance};
use crate::domain::events::{HealthEvent, RegistryEvent};
use crate::domain::ports::HealthProbe;
use crate::domain::services::{health_score, instance_condition, overall_health, InstanceCondition};
use crate::domain::value_objects::{HealthLevel, InstanceStatus};
use crate::error::GatewayResult;
use crate::infrastructure::shutdown::ShutdownController;
use crate::infrastructure::system_metrics::{ResourceThresholds, ResourceUsage, SystemSampler};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between resource samples
    pub check_interval: Duration,
    /// Latency above which a healthy instance counts as degraded
    pub response_time_threshold: Duration,
    pub thresholds: ResourceThresholds,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            response_time_threshold: Duration::from_millis(1000),
            thresholds: ResourceThresholds::default(),
            event_capacity: 256,
        }
    }
}

/// Outcome of one probe round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckRound {
    pub checked: usize,
    pub healthy: usize,
}

/// Scored view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub id: String,
    pub service: String,
    pub status: InstanceStatus,
    pub condition: InstanceCondition,
    pub score: u32,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_check_ms: Option<u64>,
}

/// Gateway-wide health summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: HealthLevel,
    pub healthy_instances: usize,
    pub total_instances: usize,
    pub resources: ResourceUsage,
    pub timestamp_ms: u64,
}

/// Active health monitor.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    registry: Arc<ServiceRegistry>,
    prober: Arc<dyn HealthProbe>,
    sampler: Arc<SystemSampler>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, registry: Arc<ServiceRegistry>, prober: Arc<dyn HealthProbe>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            registry,
            prober,
            sampler: Arc::new(SystemSampler::new()),
            events,
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Subscribe to health events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: HealthEvent) {
        let _ = self.events.send(event);
    }

    /// Interval between probe rounds.
    pub fn probe_interval(&self) -> Duration {
        self.registry.config().health_check_interval
    }

    /// Timeout for each probe.
    pub fn probe_timeout(&self) -> Duration {
        self.registry.config().health_check_timeout
    }

    /// Republish a registry event to health subscribers.
    ///
    /// Only transitions caused by call failures are relayed; probe-driven
    /// transitions are already published by `check_now`.
    pub fn relay(&self, event: &RegistryEvent) {
        if let RegistryEvent::CallFeedback(transition) = event {
            tracing::debug!(
                "instance {} marked {:?} after failed calls",
                transition.instance_id,
                transition.to
            );
            for event in HealthEvent::for_transition(transition) {
                self.emit(event);
            }
        }
    }

    /// Start the probe, relay and resource loops. All stop on shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownController) {
        let monitor = self.clone();
        let mut stop = shutdown.subscribe();
        let mut registry_events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = registry_events.recv() => match received {
                        Ok(event) => monitor.relay(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("health relay skipped {} registry events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop.recv() => {
                        tracing::debug!("registry event relay stopped");
                        break;
                    }
                }
            }
        });

        let monitor = self.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.probe_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        monitor.check_now().await;
                    }
                    _ = stop.recv() => {
                        tracing::debug!("health probe loop stopped");
                        break;
                    }
                }
            }
        });

        let monitor = self.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let usage = monitor.refresh_resources().await;
                        if usage.exceeds(&monitor.config.thresholds) {
                            tracing::warn!(
                                "resource usage above thresholds: cpu {:.1}% memory {:.1}% disk {:.1}%",
                                usage.cpu_percent,
                                usage.memory_percent,
                                usage.disk_percent
                            );
                        }
                    }
                    _ = stop.recv() => {
                        tracing::debug!("resource monitor loop stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Run one probe round over every non-quarantined instance.
    ///
    /// Probes run concurrently; results go through the registry so status
    /// transitions stay edge-triggered.
    pub async fn check_now(&self) -> CheckRound {
        let targets: Vec<Arc<ServiceInstance>> = self
            .registry
            .all_instances()
            .into_iter()
            .filter(|i| i.status() != InstanceStatus::Failed)
            .collect();

        let probes = targets.iter().map(|instance| self.probe(instance));
        let results = futures::future::join_all(probes).await;

        for (instance, result) in targets.iter().zip(results.iter()) {
            match self.registry.update_health(&instance.id, result) {
                Ok(Some(transition)) => {
                    for event in HealthEvent::for_transition(&transition) {
                        self.emit(event);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("skipping probe result: {}", e),
            }
        }

        let round = CheckRound {
            checked: targets.len(),
            healthy: results.iter().filter(|r| r.healthy).count(),
        };
        let overall = self.overall_level();
        tracing::debug!(
            "health check round: {}/{} healthy, overall {:?}",
            round.healthy,
            round.checked,
            overall
        );
        self.emit(HealthEvent::HealthCheckCompleted {
            checked: round.checked,
            healthy: round.healthy,
            overall,
        });
        round
    }

    async fn probe(&self, instance: &ServiceInstance) -> ProbeResult {
        let timeout = self.probe_timeout();
        match tokio::time::timeout(timeout, self.prober.probe(&instance.snapshot(), timeout)).await {
            Ok(result) => result,
            Err(_) => ProbeResult::failure(format!("probe timed out after {}ms", timeout.as_millis()), timeout),
        }
    }

    /// Sample host resources off the async runtime.
    pub async fn refresh_resources(&self) -> ResourceUsage {
        let sampler = self.sampler.clone();
        match tokio::task::spawn_blocking(move || sampler.sample()).await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!("resource sampling failed: {}", e);
                ResourceUsage::default()
            }
        }
    }

    /// Last sampled resource usage.
    pub fn resources(&self) -> ResourceUsage {
        self.sampler.last()
    }

    /// Score every instance.
    pub fn instance_scores(&self) -> Vec<InstanceHealth> {
        let threshold = self.config.response_time_threshold;
        self.registry
            .all_instances()
            .iter()
            .map(|instance| {
                let snapshot = instance.snapshot();
                InstanceHealth {
                    condition: instance_condition(&snapshot, threshold),
                    score: health_score(&snapshot, threshold),
                    id: snapshot.id,
                    service: snapshot.service,
                    status: snapshot.status,
                    last_latency_ms: snapshot.last_latency_ms,
                    consecutive_failures: snapshot.consecutive_failures,
                    last_check_ms: snapshot.last_check_ms,
                }
            })
            .collect()
    }

    /// Instance scores grouped by service.
    pub fn services_health(&self) -> BTreeMap<String, Vec<InstanceHealth>> {
        let mut grouped: BTreeMap<String, Vec<InstanceHealth>> = BTreeMap::new();
        for health in self.instance_scores() {
            grouped.entry(health.service.clone()).or_default().push(health);
        }
        grouped
    }

    fn overall_level(&self) -> HealthLevel {
        let all = self.registry.all_instances();
        let healthy = all.iter().filter(|i| i.status().is_selectable()).count();
        let exceeded = self.resources().exceeds(&self.config.thresholds);
        overall_health(healthy, all.len(), exceeded)
    }

    /// Gateway-wide summary from the latest probe and resource data.
    pub fn overall(&self) -> HealthSummary {
        let all = self.registry.all_instances();
        let healthy = all.iter().filter(|i| i.status().is_selectable()).count();
        let resources = self.resources();
        HealthSummary {
            status: overall_health(healthy, all.len(), resources.exceeds(&self.config.thresholds)),
            healthy_instances: healthy,
            total_instances: all.len(),
            resources,
            timestamp_ms: now_millis(),
        }
    }

    /// Probe history of one instance, oldest first.
    pub fn history(&self, instance_id: &str) -> GatewayResult<Vec<HealthCheckRecord>> {
        self.registry.history(instance_id)
    }
}
