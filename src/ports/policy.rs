use async_trait::async_trait;

use crate::domain::{BoxError, TunnelRequest};

/// Port for deciding whether a CONNECT request may open a tunnel
#[async_trait]
pub trait TunnelPolicy: Send + Sync {
    /// Return an error to refuse the tunnel. The client then gets a 403.
    async fn check(&self, request: &TunnelRequest) -> Result<(), BoxError>;
}

#[async_trait]
impl<F> TunnelPolicy for F
where
    F: Fn(&TunnelRequest) -> Result<(), BoxError> + Send + Sync,
{
    async fn check(&self, request: &TunnelRequest) -> Result<(), BoxError> {
        self(request)
    }
}
