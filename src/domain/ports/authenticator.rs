//! Authenticator Port
//!
//! The gateway does not own auth policy; it asks an external collaborator
//! before forwarding requests on protected routes.

use crate::error::GatewayResult;
use async_trait::async_trait;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify the caller's credentials.
    ///
    /// Returns `Err(Unauthorized)` on rejection and `Err(Backend)` when the
    /// collaborator could not be reached.
    async fn verify(&self, authorization: Option<&str>, correlation_id: &str) -> GatewayResult<()>;
}

/// Accepts every request. Used when no auth collaborator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn verify(&self, _authorization: Option<&str>, _correlation_id: &str) -> GatewayResult<()> {
        Ok(())
    }
}
