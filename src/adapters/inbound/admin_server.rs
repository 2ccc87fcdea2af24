//! Admin API Server
//!
//! Operator HTTP API: instance registration, health views, breaker
//! controls and traffic statistics.

use crate::adapters::outbound::MetricsCollector;
use crate::application::{LoadBalancerService, ServiceRegistry};
use crate::domain::entities::InstanceConfig;
use crate::error::GatewayError;
use crate::infrastructure::circuit_breaker::{BreakerManager, BreakerScope};
use crate::infrastructure::health_monitor::HealthMonitor;
use crate::infrastructure::shutdown::ShutdownController;
use crate::domain::value_objects::HealthLevel;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared handles for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<ServiceRegistry>,
    pub load_balancer: Arc<LoadBalancerService>,
    pub breakers: Arc<BreakerManager>,
    pub monitor: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsCollector>,
}

/// Registration response.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: String,
    pub service: String,
    pub status: String,
}

fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({
            "error": err.kind(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/services", get(services_health_handler))
        .route("/health/check", post(check_now_handler))
        .route("/api/v1/services", get(list_instances_handler))
        .route("/api/v1/services/:name", get(get_service_handler))
        .route("/api/v1/services/:name/instances", post(register_handler))
        .route("/api/v1/instances/:id", delete(deregister_handler))
        .route("/api/v1/instances/:id/reactivate", post(reactivate_handler))
        .route("/api/v1/instances/:id/history", get(history_handler))
        .route("/admin/breakers", get(breakers_handler))
        .route("/admin/breakers/:key/:action", post(breaker_action_handler))
        .route("/admin/load-balancer", get(load_balancer_handler))
        .route("/admin/load-balancer/reset", post(load_balancer_reset_handler))
        .route("/admin/metrics", get(metrics_handler))
        .route("/admin/metrics/reset", post(metrics_reset_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin API server.
pub struct AdminServer {
    listen_addr: String,
    state: AdminState,
}

impl AdminServer {
    pub fn new(listen_addr: String, state: AdminState) -> Self {
        Self { listen_addr, state }
    }

    /// Serve until shutdown is initiated.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("admin API listening on {}", self.listen_addr);

        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let summary = state.monitor.overall();
    let status = if summary.status == HealthLevel::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(serde_json::json!({
            "status": summary.status,
            "version": env!("CARGO_PKG_VERSION"),
            "healthy_instances": summary.healthy_instances,
            "total_instances": summary.total_instances,
            "resources": summary.resources,
            "timestamp_ms": summary.timestamp_ms,
        })),
    )
}

async fn services_health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({ "services": state.monitor.services_health() }))
}

async fn check_now_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.monitor.check_now().await)
}

async fn list_instances_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let instances = state.registry.get_all();
    let total = instances.len();
    Json(serde_json::json!({ "instances": instances, "total": total }))
}

async fn get_service_handler(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    let instances: Vec<_> = state
        .registry
        .instances_of(&name)
        .iter()
        .map(|i| i.snapshot())
        .collect();
    if instances.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "service": name, "error": "service not registered" })),
        )
            .into_response();
    }
    let healthy = instances.iter().filter(|i| i.status.is_selectable()).count();
    Json(serde_json::json!({
        "service": name,
        "healthy": healthy,
        "total": instances.len(),
        "traffic_health": state.metrics.service_health(&name),
        "instances": instances,
    }))
    .into_response()
}

async fn register_handler(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(config): Json<InstanceConfig>,
) -> Response {
    match state.registry.register(&name, config).await {
        Ok(id) => {
            let status = state
                .registry
                .get(&id)
                .map(|i| i.status().to_string())
                .unwrap_or_default();
            (
                StatusCode::CREATED,
                Json(RegisterResponse {
                    id,
                    service: name,
                    status,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn deregister_handler(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    if state.registry.deregister(&id) {
        if state.breakers.scope() == BreakerScope::Instance {
            state.breakers.remove(&id);
        }
        Json(serde_json::json!({ "id": id, "deregistered": true })).into_response()
    } else {
        error_response(&GatewayError::UnknownInstance(id))
    }
}

async fn reactivate_handler(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.registry.reactivate(&id).await {
        Ok(status) => Json(serde_json::json!({ "id": id, "status": status })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn history_handler(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.monitor.history(&id) {
        Ok(history) => Json(serde_json::json!({ "id": id, "history": history })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn breakers_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "scope": state.breakers.scope(),
        "breakers": state.breakers.snapshot_all(),
    }))
}

async fn breaker_action_handler(
    State(state): State<AdminState>,
    Path((key, action)): Path<(String, String)>,
) -> Response {
    let applied = match action.as_str() {
        "open" => state.breakers.force_open(&key),
        "close" => state.breakers.force_close(&key),
        "half-open" => state.breakers.force_half_open(&key),
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("unknown action {}", other) })),
            )
                .into_response()
        }
    };

    match state.breakers.get(&key) {
        Some(breaker) if applied => {
            tracing::info!("operator forced breaker {} {}", key, action);
            Json(breaker.snapshot()).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "key": key, "error": "breaker not found" })),
        )
            .into_response(),
    }
}

async fn load_balancer_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let config = state.load_balancer.config();
    Json(serde_json::json!({
        "strategy": config.strategy,
        "max_retries": config.max_retries,
        "retry_delay_ms": config.retry_delay.as_millis() as u64,
        "stats": state.load_balancer.all_stats(),
    }))
}

async fn load_balancer_reset_handler(State(state): State<AdminState>) -> impl IntoResponse {
    state.load_balancer.reset_stats();
    StatusCode::NO_CONTENT
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.metrics.summary())
}

async fn metrics_reset_handler(State(state): State<AdminState>) -> impl IntoResponse {
    state.metrics.reset();
    StatusCode::NO_CONTENT
}
