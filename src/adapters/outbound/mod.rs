mod http_authenticator;
mod http_upstream_client;
mod metrics_collector;

pub use http_authenticator::HttpAuthenticator;
pub use http_upstream_client::HttpUpstreamClient;
pub use metrics_collector::{MetricsCollector, MetricsCollectorConfig, MetricsSummary, ServiceTraffic};
