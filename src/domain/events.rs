//! Domain Events
//!
//! Notifications published over broadcast channels. Status events are
//! edge-triggered: one event per actual transition.

use crate::domain::entities::StatusTransition;
use crate::domain::value_objects::HealthLevel;
use serde::Serialize;

/// Registry membership and status changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered { instance_id: String, service: String },
    Deregistered { instance_id: String, service: String },
    /// Transition driven by a probe result or operator action
    StatusChanged(StatusTransition),
    /// Transition driven by failed calls reported by the load balancer
    CallFeedback(StatusTransition),
}

/// Health monitor notifications for subscribers such as an auto-restart
/// supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEvent {
    ServiceStatusChanged(StatusTransition),
    /// Instance went from up to unhealthy or failed
    ServiceUnhealthy(StatusTransition),
    /// Instance went from unhealthy or failed to healthy
    ServiceRecovered(StatusTransition),
    /// One full probe round finished
    HealthCheckCompleted {
        checked: usize,
        healthy: usize,
        overall: HealthLevel,
    },
}

impl HealthEvent {
    /// Events fired for one status transition, in delivery order.
    pub fn for_transition(transition: &StatusTransition) -> Vec<HealthEvent> {
        let mut events = vec![HealthEvent::ServiceStatusChanged(transition.clone())];
        if transition.to.is_down() && !transition.from.is_down() {
            events.push(HealthEvent::ServiceUnhealthy(transition.clone()));
        }
        if transition.from.is_down() && transition.to.is_selectable() {
            events.push(HealthEvent::ServiceRecovered(transition.clone()));
        }
        events
    }
}
