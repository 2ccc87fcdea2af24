//! Gateway HTTP Server
//!
//! Public listener. Every request, whatever its method or path, goes to
//! the routing core through a single fallback handler.

use crate::application::{GatewayRequest, GatewayResponse, GatewayService};
use crate::infrastructure::shutdown::ShutdownController;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Largest request body the gateway buffers before forwarding.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<GatewayService>,
    pub shutdown: ShutdownController,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Public gateway server.
pub struct GatewayServer {
    listen_addr: String,
    state: GatewayState,
}

impl GatewayServer {
    pub fn new(listen_addr: String, state: GatewayState) -> Self {
        Self { listen_addr, state }
    }

    /// Serve until shutdown is initiated.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("gateway listening on {}", self.listen_addr);

        let shutdown = self.state.shutdown.clone();
        axum::serve(
            listener,
            router(self.state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
        Ok(())
    }
}

async fn proxy_handler(State(state): State<GatewayState>, request: Request) -> Response {
    let _in_flight = state.shutdown.request_guard();

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("rejecting request body: {}", e);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({
                    "error": "payload_too_large",
                    "message": format!("request body exceeds {} bytes", MAX_BODY_BYTES),
                })),
            )
                .into_response();
        }
    };

    let gateway_request = GatewayRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect(),
        body,
        client_ip,
    };

    into_response(state.gateway.handle(gateway_request).await)
}

fn into_response(response: GatewayResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY));

    for (name, value) in &response.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(value)) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => tracing::debug!("dropping invalid response header {}", name),
        }
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
