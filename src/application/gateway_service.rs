//! Gateway Service - Main application use case
//!
//! Orchestrates one proxied request: route lookup, optional auth check,
//! instance selection, circuit breaking, forwarding and metrics.

use crate::application::load_balancer::LoadBalancerService;
use crate::domain::entities::RequestMetric;
use crate::domain::ports::{Authenticator, MetricsSink, UpstreamClient, UpstreamRequest, UpstreamResponse};
use crate::domain::services::SelectionContext;
use crate::error::{GatewayError, GatewayResult};
use crate::infrastructure::circuit_breaker::{BreakerManager, BreakerScope};
use bytes::Bytes;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const SERVED_BY_HEADER: &str = "x-served-by";

/// Service name recorded for requests that matched no route.
const UNROUTED: &str = "unrouted";

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// One path-prefix route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub prefix: String,
    pub service: String,
    pub auth_required: bool,
}

impl Route {
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            prefix: normalize_prefix(&prefix.into()),
            service: service.into(),
            auth_required: false,
        }
    }

    pub fn with_auth(mut self) -> Self {
        self.auth_required = true;
        self
    }

    /// Path remainder after this route's prefix, if the route matches.
    ///
    /// Matching is segment-aware: `/api/chat` matches `/api/chat/x` but
    /// not `/api/chatter`.
    fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.prefix == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Routes ordered for longest-prefix matching.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Route>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Find the route for `path` and the backend path it maps to.
    pub fn resolve(&self, path: &str) -> Option<(&Route, String)> {
        self.routes.iter().find_map(|route| {
            route.strip(path).map(|rest| {
                let forwarded = if rest.is_empty() { "/".to_string() } else { rest.to_string() };
                (route, forwarded)
            })
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Distinct service names referenced by the table.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.iter().map(|r| r.service.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Inbound request as seen by the routing core.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
}

impl GatewayRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: None,
            headers: Vec::new(),
            body: Bytes::new(),
            client_ip: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Reuse the caller's correlation id or mint a new one.
    pub fn correlation_id(&self) -> String {
        self.header(CORRELATION_HEADER)
            .or_else(|| self.header(REQUEST_ID_HEADER))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Response handed back to the inbound adapter.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    fn from_upstream(upstream: UpstreamResponse, correlation_id: &str, served_by: &str) -> Self {
        let mut headers: Vec<(String, Vec<u8>)> = upstream
            .headers
            .into_iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case(CORRELATION_HEADER) && !name.eq_ignore_ascii_case(SERVED_BY_HEADER)
            })
            .collect();
        headers.push((CORRELATION_HEADER.to_string(), correlation_id.as_bytes().to_vec()));
        headers.push((SERVED_BY_HEADER.to_string(), served_by.as_bytes().to_vec()));

        Self {
            status: upstream.status,
            headers,
            body: upstream.body,
        }
    }

    fn from_error(err: &GatewayError, correlation_id: &str) -> Self {
        let body = serde_json::json!({
            "error": err.kind(),
            "message": err.public_message(),
            "correlation_id": correlation_id,
        });
        Self {
            status: err.status_code(),
            headers: vec![
                ("content-type".to_string(), b"application/json".to_vec()),
                (CORRELATION_HEADER.to_string(), correlation_id.as_bytes().to_vec()),
            ],
            body: Bytes::from(body.to_string()),
        }
    }
}

/// Gateway service - main application use case.
///
/// Request flow:
/// 1. Match the longest route prefix
/// 2. Verify credentials on protected routes
/// 3. Pick an instance through the load balancer (with retries)
/// 4. Wrap the forward in the service's (or instance's) circuit breaker
/// 5. Record a request metric, success or not
pub struct GatewayService {
    routes: RouteTable,
    load_balancer: Arc<LoadBalancerService>,
    breakers: Arc<BreakerManager>,
    upstream: Arc<dyn UpstreamClient>,
    authenticator: Arc<dyn Authenticator>,
    metrics: Arc<dyn MetricsSink>,
}

impl GatewayService {
    pub fn new(
        routes: RouteTable,
        load_balancer: Arc<LoadBalancerService>,
        breakers: Arc<BreakerManager>,
        upstream: Arc<dyn UpstreamClient>,
        authenticator: Arc<dyn Authenticator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        if breakers.scope() == BreakerScope::Service {
            for service in routes.services() {
                breakers.breaker(&service);
            }
        }

        Self {
            routes,
            load_balancer,
            breakers,
            upstream,
            authenticator,
            metrics,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Handle one inbound request. Never fails: errors become JSON
    /// responses carrying the correlation id.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        let correlation_id = request.correlation_id();

        let (service, outcome) = self.dispatch(&request, &correlation_id).await;
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    GatewayError::NoRoute { .. } | GatewayError::Unauthorized(_) => tracing::debug!(
                        "{} {} rejected: {} [{}]",
                        request.method,
                        request.path,
                        err,
                        correlation_id
                    ),
                    _ => tracing::warn!(
                        "{} {} -> {} failed: {} [{}]",
                        request.method,
                        request.path,
                        service,
                        err,
                        correlation_id
                    ),
                }
                GatewayResponse::from_error(&err, &correlation_id)
            }
        };

        let latency = started.elapsed();
        tracing::debug!(
            "{} {} -> {} {} in {:?} [{}]",
            request.method,
            request.path,
            service,
            response.status,
            latency,
            correlation_id
        );

        self.metrics.record(
            RequestMetric::new(&request.method, &request.path, &service, response.status, latency)
                .with_correlation_id(&correlation_id),
        );

        response
    }

    async fn dispatch(
        &self,
        request: &GatewayRequest,
        correlation_id: &str,
    ) -> (String, GatewayResult<GatewayResponse>) {
        let (route, forwarded_path) = match self.routes.resolve(&request.path) {
            Some(found) => found,
            None => {
                return (
                    UNROUTED.to_string(),
                    Err(GatewayError::NoRoute {
                        path: request.path.clone(),
                    }),
                )
            }
        };
        let service = route.service.clone();

        if route.auth_required {
            if let Err(err) = self
                .authenticator
                .verify(request.header("authorization"), correlation_id)
                .await
            {
                return (service, Err(err));
            }
        }

        let upstream_request = Self::build_upstream_request(request, forwarded_path, correlation_id);
        let ctx = SelectionContext {
            client_ip: request.client_ip,
        };

        let result = self
            .load_balancer
            .execute_request(&service, &ctx, |instance| {
                let breaker = self.breakers.breaker(&self.breakers.key_for(&service, &instance.id));
                let upstream = self.upstream.clone();
                let outbound = upstream_request.clone();
                async move {
                    let snapshot = instance.snapshot();
                    let response = breaker
                        .execute(move || async move {
                            let response = upstream.forward(&snapshot, outbound).await?;
                            if response.status >= 500 {
                                return Err(GatewayError::Backend {
                                    message: format!("{} returned {}", snapshot.id, response.status),
                                    status: Some(response.status),
                                });
                            }
                            Ok(response)
                        })
                        .await?;
                    Ok::<_, GatewayError>((response, instance.id.clone()))
                }
            })
            .await;

        let response = result.map(|(upstream, served_by)| {
            GatewayResponse::from_upstream(upstream, correlation_id, &served_by)
        });
        (service, response)
    }

    fn build_upstream_request(
        request: &GatewayRequest,
        forwarded_path: String,
        correlation_id: &str,
    ) -> UpstreamRequest {
        let path_and_query = match &request.query {
            Some(q) if !q.is_empty() => format!("{}?{}", forwarded_path, q),
            _ => forwarded_path,
        };

        let mut outbound = UpstreamRequest::new(&request.method, path_and_query);
        outbound.headers = request
            .headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .cloned()
            .collect();
        outbound.body = request.body.clone();
        outbound.set_header(CORRELATION_HEADER, correlation_id.as_bytes().to_vec());
        if let Some(ip) = request.client_ip {
            outbound.set_header("x-forwarded-for", ip.to_string().into_bytes());
        }
        outbound
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::application::load_balancer::LoadBalancerConfig;
    use crate::application::service_registry::ServiceRegistry;
    use crate::domain::entities::{InstanceConfig, InstanceSnapshot, ProbeResult};
    use crate::domain::ports::AllowAll;
    use crate::infrastructure::circuit_breaker::CircuitBreakerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    // ===== Mock Implementations =====

    struct MockUpstream {
        status: AtomicU16,
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, UpstreamRequest)>>,
    }

    impl MockUpstream {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(Self {
                status: AtomicU16::new(status),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn forward(
            &self,
            instance: &InstanceSnapshot,
            request: UpstreamRequest,
        ) -> GatewayResult<UpstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((instance.id.clone(), request));
            Ok(UpstreamResponse {
                status: self.status.load(Ordering::SeqCst),
                headers: vec![
                    ("content-type".into(), b"text/plain".to_vec()),
                    ("connection".into(), b"keep-alive".to_vec()),
                ],
                body: Bytes::from_static(b"pong"),
            })
        }
    }

    struct DenyAll;

    #[async_trait]
    impl Authenticator for DenyAll {
        async fn verify(&self, _authorization: Option<&str>, _correlation_id: &str) -> GatewayResult<()> {
            Err(GatewayError::Unauthorized("invalid token".into()))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        metrics: Mutex<Vec<RequestMetric>>,
    }

    impl MetricsSink for CollectingSink {
        fn record(&self, metric: RequestMetric) {
            self.metrics.lock().unwrap().push(metric);
        }
    }

    // ===== Test Helpers =====

    struct Harness {
        gateway: GatewayService,
        upstream: Arc<MockUpstream>,
        sink: Arc<CollectingSink>,
        breakers: Arc<BreakerManager>,
        registry: Arc<ServiceRegistry>,
    }

    async fn harness(status: u16, authenticator: Arc<dyn Authenticator>) -> Harness {
        let registry = Arc::new(ServiceRegistry::default());
        for port in [3002, 3003] {
            let id = registry
                .register("chat", InstanceConfig::new("127.0.0.1", port))
                .await
                .unwrap();
            registry
                .update_health(&id, &ProbeResult::success(Duration::from_millis(1)))
                .unwrap();
        }

        let lb = Arc::new(LoadBalancerService::new(
            registry.clone(),
            LoadBalancerConfig {
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        ));
        let breakers = Arc::new(BreakerManager::new(CircuitBreakerConfig::default(), BreakerScope::Service));
        let upstream = MockUpstream::new(status);
        let sink = Arc::new(CollectingSink::default());

        let routes = RouteTable::new(vec![
            Route::new("/api/chat", "chat"),
            Route::new("/api/users", "users"),
            Route::new("/api/secure", "chat").with_auth(),
        ]);

        let gateway = GatewayService::new(
            routes,
            lb,
            breakers.clone(),
            upstream.clone(),
            authenticator,
            sink.clone(),
        );

        Harness {
            gateway,
            upstream,
            sink,
            breakers,
            registry,
        }
    }

    // ===== Route Table =====

    #[test]
    fn test_route_longest_prefix_wins() {
        let table = RouteTable::new(vec![Route::new("/api", "root"), Route::new("/api/chat", "chat")]);

        let (route, path) = table.resolve("/api/chat/rooms/1").unwrap();
        assert_eq!(route.service, "chat");
        assert_eq!(path, "/rooms/1");

        let (route, path) = table.resolve("/api/other").unwrap();
        assert_eq!(route.service, "root");
        assert_eq!(path, "/other");
    }

    #[test]
    fn test_route_is_segment_aware() {
        let table = RouteTable::new(vec![Route::new("/api/chat", "chat")]);
        assert!(table.resolve("/api/chatter").is_none());
        assert_eq!(table.resolve("/api/chat").unwrap().1, "/");
        assert_eq!(table.resolve("/api/chat/").unwrap().1, "/");
    }

    #[test]
    fn test_route_prefix_normalized() {
        assert_eq!(Route::new("api/chat/", "chat").prefix, "/api/chat");
        assert_eq!(Route::new("", "all").prefix, "/");

        let table = RouteTable::new(vec![Route::new("/", "all")]);
        assert_eq!(table.resolve("/anything").unwrap().1, "/anything");
    }

    #[test]
    fn test_correlation_id_reuse_and_generation() {
        let mut request = GatewayRequest::new("GET", "/api/chat");
        request.headers.push(("X-Request-Id".into(), b"req-7".to_vec()));
        assert_eq!(request.correlation_id(), "req-7");

        request.headers.push(("x-correlation-id".into(), b"corr-1".to_vec()));
        assert_eq!(request.correlation_id(), "corr-1");

        let generated = GatewayRequest::new("GET", "/").correlation_id();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    // ===== Request Handling =====

    #[tokio::test]
    async fn test_handle_forwards_to_backend() {
        let h = harness(200, Arc::new(AllowAll)).await;
        let mut request = GatewayRequest::new("GET", "/api/chat/rooms");
        request.query = Some("page=2".into());
        request.headers.push(("x-correlation-id".into(), b"abc-123".to_vec()));
        request.client_ip = Some("203.0.113.9".parse().unwrap());

        let response = h.gateway.handle(request).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"pong"));
        assert_eq!(response.header("x-correlation-id"), Some("abc-123"));
        assert_eq!(response.header("x-served-by"), Some("chat:127.0.0.1:3002"));
        assert!(response.header("connection").is_none());

        let seen = h.upstream.seen.lock().unwrap();
        let (_, outbound) = &seen[0];
        assert_eq!(outbound.path_and_query, "/rooms?page=2");
        assert_eq!(outbound.header("x-correlation-id"), Some(&b"abc-123"[..]));
        assert_eq!(outbound.header("x-forwarded-for"), Some(&b"203.0.113.9"[..]));

        let metrics = h.sink.metrics.lock().unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].service, "chat");
        assert_eq!(metrics[0].status_code, 200);
        assert_eq!(metrics[0].correlation_id.as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn test_handle_no_route() {
        let h = harness(200, Arc::new(AllowAll)).await;
        let response = h.gateway.handle(GatewayRequest::new("GET", "/nowhere")).await;

        assert_eq!(response.status, 404);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "no_route");
        assert!(body["correlation_id"].is_string());
        assert_eq!(h.upstream.calls(), 0);
        assert_eq!(h.sink.metrics.lock().unwrap()[0].service, "unrouted");
    }

    #[tokio::test]
    async fn test_handle_no_healthy_instances() {
        let h = harness(200, Arc::new(AllowAll)).await;
        let response = h.gateway.handle(GatewayRequest::new("GET", "/api/users")).await;

        assert_eq!(response.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "no_healthy_instances");
    }

    #[tokio::test]
    async fn test_handle_circuit_open_skips_backend() {
        let h = harness(200, Arc::new(AllowAll)).await;
        assert!(h.breakers.force_open("chat"));

        let response = h.gateway.handle(GatewayRequest::new("GET", "/api/chat")).await;

        assert_eq!(response.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "circuit_open");
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_handle_backend_5xx_becomes_502() {
        let h = harness(500, Arc::new(AllowAll)).await;
        let response = h.gateway.handle(GatewayRequest::new("POST", "/api/chat/send")).await;

        assert_eq!(response.status, 502);
        // Retried on each attempt
        assert_eq!(h.upstream.calls(), 3);
        assert_eq!(h.sink.metrics.lock().unwrap()[0].status_code, 502);
    }

    #[tokio::test]
    async fn test_handle_backend_4xx_forwarded() {
        let h = harness(404, Arc::new(AllowAll)).await;
        let response = h.gateway.handle(GatewayRequest::new("GET", "/api/chat/missing")).await;

        assert_eq!(response.status, 404);
        assert_eq!(response.body, Bytes::from_static(b"pong"));
        assert_eq!(h.upstream.calls(), 1);
        let failed: u64 = h.registry.all_instances().iter().map(|i| i.failed_requests()).sum();
        assert_eq!(failed, 0);
    }

    #[tokio::test]
    async fn test_handle_auth_rejection() {
        let h = harness(200, Arc::new(DenyAll)).await;

        let response = h.gateway.handle(GatewayRequest::new("GET", "/api/secure/me")).await;
        assert_eq!(response.status, 401);
        assert_eq!(h.upstream.calls(), 0);

        // Unprotected routes skip the check
        let response = h.gateway.handle(GatewayRequest::new("GET", "/api/chat")).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_breakers_precreated_for_routed_services() {
        let h = harness(200, Arc::new(AllowAll)).await;
        assert!(h.breakers.get("chat").is_some());
        assert!(h.breakers.get("users").is_some());
    }
}
