//! Integration tests for the request path with Wiremock backends
//!
//! Builds the full stack (registry, load balancer, breakers, HTTP
//! forwarder, metrics) and drives it through the public router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use service_gateway::adapters::inbound::{gateway_router, GatewayState};
use service_gateway::adapters::outbound::{HttpAuthenticator, HttpUpstreamClient, MetricsCollector};
use service_gateway::application::{
    GatewayService, LoadBalancerConfig, LoadBalancerService, RegistryConfig, Route, RouteTable,
    ServiceRegistry,
};
use service_gateway::domain::entities::{InstanceConfig, ProbeResult};
use service_gateway::domain::ports::{AllowAll, Authenticator};
use service_gateway::domain::value_objects::InstanceStatus;
use service_gateway::infrastructure::{
    BreakerManager, BreakerScope, CircuitBreakerConfig, CircuitState, ShutdownController,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Stack {
    state: GatewayState,
    registry: Arc<ServiceRegistry>,
    load_balancer: Arc<LoadBalancerService>,
    breakers: Arc<BreakerManager>,
    metrics: Arc<MetricsCollector>,
}

async fn start_backend(name: &str, status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(path("/rooms"))
        .respond_with(ResponseTemplate::new(status).set_body_string(name))
        .mount(&server)
        .await;
    server
}

async fn build_stack(
    backends: &[&MockServer],
    lb_config: LoadBalancerConfig,
    breaker_config: CircuitBreakerConfig,
    authenticator: Arc<dyn Authenticator>,
    route: Route,
) -> Stack {
    let client = Arc::new(HttpUpstreamClient::new(Duration::from_secs(2)).unwrap());
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()).with_prober(client.clone()));
    for backend in backends {
        let port = backend.address().port();
        registry
            .register("chat-service", InstanceConfig::new("127.0.0.1", port))
            .await
            .unwrap();
    }

    let breakers = Arc::new(BreakerManager::new(breaker_config, BreakerScope::Service));
    let metrics = Arc::new(MetricsCollector::default());
    let load_balancer = Arc::new(LoadBalancerService::new(registry.clone(), lb_config));
    let gateway = GatewayService::new(
        RouteTable::new(vec![route]),
        load_balancer.clone(),
        breakers.clone(),
        client,
        authenticator,
        metrics.clone(),
    );

    Stack {
        state: GatewayState {
            gateway: Arc::new(gateway),
            shutdown: ShutdownController::new(),
        },
        registry,
        load_balancer,
        breakers,
        metrics,
    }
}

async fn get(state: &GatewayState, uri: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = gateway_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_round_robin_across_backends() {
    let a = start_backend("a", 200).await;
    let b = start_backend("b", 200).await;
    let stack = build_stack(
        &[&a, &b],
        LoadBalancerConfig::default(),
        CircuitBreakerConfig::default(),
        Arc::new(AllowAll),
        Route::new("/api/chat", "chat-service"),
    )
    .await;

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let (status, body) = get(&stack.state, "/api/chat/rooms").await;
        assert_eq!(status, StatusCode::OK);
        bodies.push(body);
    }

    assert_eq!(bodies.iter().filter(|b| *b == "a").count(), 2);
    assert_eq!(bodies.iter().filter(|b| *b == "b").count(), 2);
    assert_eq!(stack.metrics.total_requests(), 4);
    assert_eq!(stack.metrics.error_requests(), 0);
}

#[tokio::test]
async fn test_failover_to_healthy_backend() {
    let bad = start_backend("bad", 500).await;
    let good = start_backend("good", 200).await;
    let stack = build_stack(
        &[&bad, &good],
        LoadBalancerConfig {
            retry_delay: Duration::from_millis(1),
            ..LoadBalancerConfig::default()
        },
        CircuitBreakerConfig {
            minimum_requests: 100,
            ..CircuitBreakerConfig::default()
        },
        Arc::new(AllowAll),
        Route::new("/api/chat", "chat-service"),
    )
    .await;

    for _ in 0..6 {
        let (status, body) = get(&stack.state, "/api/chat/rooms").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "good");
    }
}

#[tokio::test]
async fn test_last_instance_dropping_out_keeps_backend_error() {
    let backend = start_backend("boom", 500).await;
    let stack = build_stack(
        &[&backend],
        LoadBalancerConfig {
            retry_delay: Duration::from_millis(1),
            ..LoadBalancerConfig::default()
        },
        CircuitBreakerConfig {
            minimum_requests: 100,
            ..CircuitBreakerConfig::default()
        },
        Arc::new(AllowAll),
        Route::new("/api/chat", "chat-service"),
    )
    .await;

    // Two earlier failed calls; the next one takes the only instance out.
    let id = stack.registry.get_healthy(Some("chat-service"))[0].id.clone();
    let instance = stack.registry.get(&id).unwrap();
    stack.registry.report_failure(&instance);
    stack.registry.report_failure(&instance);

    let (status, body) = get(&stack.state, "/api/chat/rooms").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"], "backend_error");

    assert_eq!(instance.status(), InstanceStatus::Unhealthy);
    let stats = stack.load_balancer.stats("chat-service").unwrap();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stack.metrics.error_requests(), 1);
}

#[tokio::test]
async fn test_client_errors_are_forwarded_verbatim() {
    let backend = start_backend("missing", 404).await;
    let stack = build_stack(
        &[&backend],
        LoadBalancerConfig::default(),
        CircuitBreakerConfig::default(),
        Arc::new(AllowAll),
        Route::new("/api/chat", "chat-service"),
    )
    .await;

    let (status, body) = get(&stack.state, "/api/chat/rooms").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "missing");

    let snapshot = stack.breakers.get("chat-service").unwrap().snapshot();
    assert_eq!(snapshot.failures, 0);
}

#[tokio::test]
async fn test_breaker_opens_after_backend_failures() {
    let backend = start_backend("boom", 500).await;
    let stack = build_stack(
        &[&backend],
        LoadBalancerConfig {
            max_retries: 1,
            ..LoadBalancerConfig::default()
        },
        CircuitBreakerConfig {
            minimum_requests: 2,
            ..CircuitBreakerConfig::default()
        },
        Arc::new(AllowAll),
        Route::new("/api/chat", "chat-service"),
    )
    .await;

    for _ in 0..2 {
        let (status, _) = get(&stack.state, "/api/chat/rooms").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    let breaker = stack.breakers.get("chat-service").unwrap();
    assert_eq!(breaker.snapshot().state, CircuitState::Open);

    let (status, body) = get(&stack.state, "/api/chat/rooms").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"], "circuit_open");
}

#[tokio::test]
async fn test_protected_route_checks_credentials() {
    let backend = start_backend("secret", 200).await;

    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/verify"))
        .and(header("authorization", "Bearer good"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&auth)
        .await;
    Mock::given(method("GET"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&auth)
        .await;

    let authenticator = HttpAuthenticator::new(format!("{}/verify", auth.uri()), Duration::from_secs(1)).unwrap();
    let stack = build_stack(
        &[&backend],
        LoadBalancerConfig::default(),
        CircuitBreakerConfig::default(),
        Arc::new(authenticator),
        Route::new("/api/chat", "chat-service").with_auth(),
    )
    .await;

    let (status, _) = get(&stack.state, "/api/chat/rooms").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/chat/rooms")
        .header("authorization", "Bearer bad")
        .body(Body::empty())
        .unwrap();
    let response = gateway_router(stack.state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/chat/rooms")
        .header("authorization", "Bearer good")
        .body(Body::empty())
        .unwrap();
    let response = gateway_router(stack.state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_correlation_id_reaches_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/rooms"))
        .and(header("x-correlation-id", "trace-42"))
        .respond_with(ResponseTemplate::new(200).set_body_string("traced"))
        .expect(1)
        .mount(&backend)
        .await;

    let stack = build_stack(
        &[&backend],
        LoadBalancerConfig::default(),
        CircuitBreakerConfig::default(),
        Arc::new(AllowAll),
        Route::new("/api/chat", "chat-service"),
    )
    .await;

    let request = Request::builder()
        .uri("/api/chat/rooms")
        .header("x-correlation-id", "trace-42")
        .body(Body::empty())
        .unwrap();
    let response = gateway_router(stack.state.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-correlation-id"], "trace-42");
}

#[tokio::test]
async fn test_unreachable_backend_returns_bad_gateway() {
    // Bind then drop to get a port with nothing listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = Arc::new(HttpUpstreamClient::new(Duration::from_millis(500)).unwrap());
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let id = registry
        .register("chat-service", InstanceConfig::new("127.0.0.1", port))
        .await
        .unwrap();
    registry
        .update_health(&id, &ProbeResult::success(Duration::from_millis(1)))
        .unwrap();
    let gateway = GatewayService::new(
        RouteTable::new(vec![Route::new("/api/chat", "chat-service")]),
        Arc::new(LoadBalancerService::new(
            registry,
            LoadBalancerConfig {
                max_retries: 1,
                ..LoadBalancerConfig::default()
            },
        )),
        Arc::new(BreakerManager::new(CircuitBreakerConfig::default(), BreakerScope::Service)),
        client,
        Arc::new(AllowAll),
        Arc::new(MetricsCollector::default()),
    );
    let state = GatewayState {
        gateway: Arc::new(gateway),
        shutdown: ShutdownController::new(),
    };

    let (status, body) = get(&state, "/api/chat/rooms").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"], "backend_error");
}
