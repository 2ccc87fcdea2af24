//! HTTP Authenticator
//!
//! Asks the auth service whether the caller's `Authorization` header is
//! valid. Policy stays with the auth service.

use crate::domain::ports::Authenticator;
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::time::Duration;

pub struct HttpAuthenticator {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpAuthenticator {
    pub fn new(verify_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            verify_url: verify_url.into(),
        })
    }

    pub fn verify_url(&self) -> &str {
        &self.verify_url
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn verify(&self, authorization: Option<&str>, correlation_id: &str) -> GatewayResult<()> {
        let token = authorization
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GatewayError::Unauthorized("missing credentials".into()))?;

        let response = self
            .client
            .get(&self.verify_url)
            .header("authorization", token)
            .header("x-correlation-id", correlation_id)
            .send()
            .await
            .map_err(|e| GatewayError::backend(format!("auth service unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(GatewayError::Unauthorized("invalid credentials".into()))
        } else {
            Err(GatewayError::Backend {
                message: format!("auth service returned {}", status),
                status: Some(status.as_u16()),
            })
        }
    }
}
