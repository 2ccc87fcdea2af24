//! Health Scoring
//!
//! Pure functions turning instance snapshots into a 0-100 score and the
//! gateway-wide classification.

use crate::domain::entities::InstanceSnapshot;
use crate::domain::value_objects::{HealthLevel, InstanceStatus};
use serde::Serialize;
use std::time::Duration;

/// Probe-derived condition of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceCondition {
    Healthy,
    /// Passing probes but slower than the response-time threshold
    Degraded,
    Unhealthy,
    Unknown,
}

/// Classify an instance from its status and last latency.
pub fn instance_condition(snapshot: &InstanceSnapshot, response_time_threshold: Duration) -> InstanceCondition {
    match snapshot.status {
        InstanceStatus::Unhealthy | InstanceStatus::Failed => InstanceCondition::Unhealthy,
        InstanceStatus::Unknown => InstanceCondition::Unknown,
        InstanceStatus::Healthy if exceeds(snapshot, response_time_threshold) => InstanceCondition::Degraded,
        InstanceStatus::Healthy => InstanceCondition::Healthy,
    }
}

fn exceeds(snapshot: &InstanceSnapshot, threshold: Duration) -> bool {
    snapshot
        .last_latency_ms
        .map(|ms| ms > threshold.as_millis() as u64)
        .unwrap_or(false)
}

fn error_rate(snapshot: &InstanceSnapshot) -> f64 {
    if snapshot.total_requests == 0 {
        return 0.0;
    }
    snapshot.failed_requests as f64 / snapshot.total_requests as f64
}

/// Composite 0-100 score.
///
/// 100, minus 50 when unhealthy (25 when degraded), minus the error rate
/// in percent capped at 30, minus 20 for latency over the threshold, minus
/// 5 per consecutive failure capped at 20. Never below 0.
pub fn health_score(snapshot: &InstanceSnapshot, response_time_threshold: Duration) -> u32 {
    let mut score: f64 = 100.0;

    match instance_condition(snapshot, response_time_threshold) {
        InstanceCondition::Unhealthy => score -= 50.0,
        InstanceCondition::Degraded => score -= 25.0,
        InstanceCondition::Healthy | InstanceCondition::Unknown => {}
    }

    score -= (error_rate(snapshot) * 100.0).min(30.0);

    if exceeds(snapshot, response_time_threshold) {
        score -= 20.0;
    }

    score -= (snapshot.consecutive_failures as f64 * 5.0).min(20.0);

    score.max(0.0).round() as u32
}

/// Gateway-wide classification from healthy/total instance counts.
///
/// An empty registry cannot serve anything and is reported as critical.
pub fn overall_health(healthy: usize, total: usize, resources_exceeded: bool) -> HealthLevel {
    if total == 0 {
        return HealthLevel::Critical;
    }
    let level = HealthLevel::from_ratio(healthy as f64 / total as f64);
    if resources_exceeded {
        level.at_least_degraded()
    } else {
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{InstanceConfig, ServiceInstance};

    const THRESHOLD: Duration = Duration::from_millis(1000);

    fn snap(status: InstanceStatus) -> InstanceSnapshot {
        let mut s = ServiceInstance::new("chat", InstanceConfig::new("127.0.0.1", 3002)).snapshot();
        s.status = status;
        s
    }

    #[test]
    fn test_perfect_score() {
        assert_eq!(health_score(&snap(InstanceStatus::Healthy), THRESHOLD), 100);
    }

    #[test]
    fn test_unhealthy_penalty() {
        assert_eq!(health_score(&snap(InstanceStatus::Unhealthy), THRESHOLD), 50);
    }

    #[test]
    fn test_slow_instance_is_degraded() {
        let mut s = snap(InstanceStatus::Healthy);
        s.last_latency_ms = Some(1500);
        assert_eq!(instance_condition(&s, THRESHOLD), InstanceCondition::Degraded);
        // -25 degraded, -20 latency
        assert_eq!(health_score(&s, THRESHOLD), 55);
    }

    #[test]
    fn test_error_rate_penalty_is_capped() {
        let mut s = snap(InstanceStatus::Healthy);
        s.total_requests = 10;
        s.failed_requests = 1;
        assert_eq!(health_score(&s, THRESHOLD), 90);

        s.failed_requests = 9;
        assert_eq!(health_score(&s, THRESHOLD), 70);
    }

    #[test]
    fn test_consecutive_failure_penalty_is_capped() {
        let mut s = snap(InstanceStatus::Healthy);
        s.consecutive_failures = 2;
        assert_eq!(health_score(&s, THRESHOLD), 90);
        s.consecutive_failures = 10;
        assert_eq!(health_score(&s, THRESHOLD), 80);
    }

    #[test]
    fn test_score_never_negative() {
        let mut s = snap(InstanceStatus::Failed);
        s.total_requests = 10;
        s.failed_requests = 10;
        s.consecutive_failures = 10;
        s.last_latency_ms = Some(5000);
        // 100 - 50 - 30 - 20 - 20 = -20 -> 0
        assert_eq!(health_score(&s, THRESHOLD), 0);
    }

    #[test]
    fn test_overall_health_thresholds() {
        assert_eq!(overall_health(8, 10, false), HealthLevel::Healthy);
        assert_eq!(overall_health(5, 10, false), HealthLevel::Degraded);
        assert_eq!(overall_health(4, 10, false), HealthLevel::Critical);
        assert_eq!(overall_health(0, 0, false), HealthLevel::Critical);
    }

    #[test]
    fn test_overall_health_resource_downgrade() {
        assert_eq!(overall_health(10, 10, true), HealthLevel::Degraded);
        assert_eq!(overall_health(1, 10, true), HealthLevel::Critical);
    }
}
