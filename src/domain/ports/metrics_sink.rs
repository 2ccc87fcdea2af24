//! Metrics Sink Port
//!
//! Write side of the metrics collector as seen by the routing core.

use crate::domain::entities::RequestMetric;

/// Passive observer of completed requests.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: RequestMetric);
}
