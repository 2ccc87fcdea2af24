//! Gateway Errors
//!
//! One error type flows through the whole request path so the routing core
//! can classify any failure into the status code its caller sees.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the gateway's control-plane components.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The breaker rejected the call without invoking it.
    #[error("circuit open for {key}")]
    CircuitOpen { key: String },

    /// The call exceeded its deadline.
    #[error("operation timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// No instance of the service is currently selectable.
    #[error("no healthy instances for service {service}")]
    NoHealthyInstances { service: String },

    /// The call was attempted and the backend or the transport failed.
    #[error("backend error: {message}")]
    Backend { message: String, status: Option<u16> },

    /// Health probe failure. Only ever affects registry state.
    #[error("health probe failed: {0}")]
    Probe(String),

    /// No route prefix matched the request path.
    #[error("no route for path {path}")]
    NoRoute { path: String },

    /// The auth collaborator rejected the request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Registration payload failed validation.
    #[error("invalid instance config: {0}")]
    InvalidConfig(String),

    #[error("unknown instance {0}")]
    UnknownInstance(String),
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Create a backend error without an upstream status.
    pub fn backend(message: impl Into<String>) -> Self {
        GatewayError::Backend {
            message: message.into(),
            status: None,
        }
    }

    /// HTTP status the routing core returns for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::CircuitOpen { .. } | GatewayError::NoHealthyInstances { .. } => 503,
            GatewayError::Timeout { .. }
            | GatewayError::Backend { .. }
            | GatewayError::Probe(_) => 502,
            GatewayError::NoRoute { .. } | GatewayError::UnknownInstance(_) => 404,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::InvalidConfig(_) => 400,
        }
    }

    /// Whether the load balancer may retry the call on another attempt.
    ///
    /// Only failures of an already-selected instance qualify; local
    /// decisions (open circuit, empty pool) are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Backend { .. } | GatewayError::Timeout { .. }
        )
    }

    /// Short machine-readable kind, used in JSON error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::NoHealthyInstances { .. } => "no_healthy_instances",
            GatewayError::Backend { .. } => "backend_error",
            GatewayError::Probe(_) => "probe_error",
            GatewayError::NoRoute { .. } => "no_route",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::InvalidConfig(_) => "invalid_config",
            GatewayError::UnknownInstance(_) => "unknown_instance",
        }
    }

    /// Message shown to gateway callers.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::CircuitOpen { key } => format!("circuit open for {}", key),
            GatewayError::NoHealthyInstances { service } => {
                format!("no healthy instances for {}", service)
            }
            GatewayError::Backend { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
