//! Upstream Client Port
//!
//! Defines how the routing core talks to a selected backend instance.

use crate::domain::entities::InstanceSnapshot;
use crate::error::GatewayResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Request to forward to a backend, already stripped of its route prefix.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    /// Path and query relative to the instance's base path
    pub path_and_query: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn new(method: impl Into<String>, path_and_query: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path_and_query: path_and_query.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Replace any header with the same (case-insensitive) name.
    pub fn set_header(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

/// Response returned by a backend, forwarded verbatim to the caller.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

/// Transport to backend instances.
///
/// Any response the backend produces is `Ok`, whatever its status; `Err`
/// means the exchange itself failed.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn forward(
        &self,
        instance: &InstanceSnapshot,
        request: UpstreamRequest,
    ) -> GatewayResult<UpstreamResponse>;
}
