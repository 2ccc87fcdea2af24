mod authenticator;
mod health_probe;
mod metrics_sink;
mod upstream_client;

pub use authenticator::{AllowAll, Authenticator};
pub use health_probe::HealthProbe;
pub use metrics_sink::MetricsSink;
pub use upstream_client::{UpstreamClient, UpstreamRequest, UpstreamResponse};
