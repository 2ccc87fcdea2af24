//! HTTP Upstream Client
//!
//! reqwest-based transport used both to forward proxied requests and to
//! probe instance health endpoints.

use crate::domain::entities::{InstanceSnapshot, ProbeResult};
use crate::domain::ports::{HealthProbe, UpstreamClient, UpstreamRequest, UpstreamResponse};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::{Duration, Instant};

/// reqwest-backed upstream client and health prober.
#[derive(Clone)]
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUpstreamClient {
    /// Create a client whose requests give up after `timeout`.
    ///
    /// Redirects are passed back to the caller untouched.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, timeout })
    }

    fn header_map(headers: &[(String, Vec<u8>)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(value)) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => tracing::debug!("dropping invalid header {}", name),
            }
        }
        map
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn forward(
        &self,
        instance: &InstanceSnapshot,
        request: UpstreamRequest,
    ) -> GatewayResult<UpstreamResponse> {
        let url = instance.url_for(&request.path_and_query);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| GatewayError::backend(format!("unsupported method {}", request.method)))?;

        let response = self
            .client
            .request(method, &url)
            .headers(Self::header_map(&request.headers))
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout { after: self.timeout }
                } else {
                    GatewayError::backend(format!("request to {} failed: {}", instance.id, e))
                }
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::backend(format!("reading response from {} failed: {}", instance.id, e)))?;

        Ok(UpstreamResponse { status, headers, body })
    }
}

#[async_trait]
impl HealthProbe for HttpUpstreamClient {
    async fn probe(&self, instance: &InstanceSnapshot, timeout: Duration) -> ProbeResult {
        let url = instance.health_url();
        let started = Instant::now();

        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => ProbeResult::success(started.elapsed()),
            Ok(resp) => ProbeResult::failure(format!("unhealthy status: {}", resp.status()), started.elapsed()),
            Err(e) if e.is_timeout() => {
                ProbeResult::failure(format!("probe timed out after {}ms", timeout.as_millis()), started.elapsed())
            }
            Err(e) => ProbeResult::failure(format!("request failed: {}", e), started.elapsed()),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::{InstanceConfig, ServiceInstance};
    use bytes::Bytes;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot_for(server: &MockServer) -> InstanceSnapshot {
        let addr = server.address();
        ServiceInstance::new("chat", InstanceConfig::new(addr.ip().to_string(), addr.port())).snapshot()
    }

    fn client() -> HttpUpstreamClient {
        HttpUpstreamClient::new(Duration::from_secs(2)).unwrap()
    }

    // ===== Forwarding =====

    #[tokio::test]
    async fn test_forward_passes_request_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(query_param("room", "7"))
            .and(header("x-correlation-id", "abc"))
            .and(body_string("hello"))
            .respond_with(ResponseTemplate::new(201).insert_header("x-backend", "chat-1").set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let mut request = UpstreamRequest::new("POST", "/messages?room=7");
        request.set_header("x-correlation-id", "abc");
        request.body = Bytes::from_static(b"hello");

        let response = client().forward(&snapshot_for(&server), request).await.unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, Bytes::from_static(b"ok"));
        assert!(response
            .headers
            .iter()
            .any(|(n, v)| n == "x-backend" && v.as_slice() == b"chat-1"));
    }

    #[tokio::test]
    async fn test_forward_returns_error_statuses_as_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let response = client()
            .forward(&snapshot_for(&server), UpstreamRequest::new("GET", "/"))
            .await
            .unwrap();
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn test_forward_connection_refused_is_backend_error() {
        let snapshot = ServiceInstance::new("chat", InstanceConfig::new("127.0.0.1", 1)).snapshot();
        let err = client()
            .forward(&snapshot, UpstreamRequest::new("GET", "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_forward_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = HttpUpstreamClient::new(Duration::from_millis(100)).unwrap();
        let err = client
            .forward(&snapshot_for(&server), UpstreamRequest::new("GET", "/slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
    }

    // ===== Probing =====

    #[tokio::test]
    async fn test_probe_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let result = client().probe(&snapshot_for(&server), Duration::from_secs(1)).await;
        assert!(result.healthy);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_probe_unhealthy_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = client().probe(&snapshot_for(&server), Duration::from_secs(1)).await;
        assert!(!result.healthy);
        assert!(result.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let result = client().probe(&snapshot_for(&server), Duration::from_millis(100)).await;
        assert!(!result.healthy);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
