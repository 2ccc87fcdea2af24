//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Runtime status of a service instance.
///
/// `Failed` is a quarantine state: the instance stays in the registry for
/// diagnostics but is never selected until an operator reactivates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
        }
    }

    /// Only healthy instances take traffic.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Unhealthy or quarantined.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Unhealthy | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Protocol spoken by a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    /// Parse a protocol name, falling back to plain HTTP.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "https" => Self::Https,
            _ => Self::Http,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rule used to pick one instance among the healthy candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    IpHash,
    Random,
    FastestResponse,
}

impl LoadBalancingStrategy {
    /// Parse a strategy name. Accepts kebab-case and snake_case spellings.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "round-robin" => Some(Self::RoundRobin),
            "weighted" => Some(Self::Weighted),
            "least-connections" => Some(Self::LeastConnections),
            "ip-hash" => Some(Self::IpHash),
            "random" => Some(Self::Random),
            "fastest-response" => Some(Self::FastestResponse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
            Self::LeastConnections => "least-connections",
            Self::IpHash => "ip-hash",
            Self::Random => "random",
            Self::FastestResponse => "fastest-response",
        }
    }
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Three-level health classification shared by the health monitor and
/// the metrics collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

impl HealthLevel {
    /// Classify a healthy/total ratio: ≥80% healthy, ≥50% degraded.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.8 {
            Self::Healthy
        } else if ratio >= 0.5 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }

    /// Downgrade to at least `Degraded`.
    pub fn at_least_degraded(self) -> Self {
        match self {
            Self::Healthy => Self::Degraded,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
