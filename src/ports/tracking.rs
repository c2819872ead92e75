use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::TunnelInfo;

/// Port for tracking open tunnels
#[async_trait]
pub trait TrackingPort: Send + Sync {
    /// Register a tunnel once its response has been sent
    async fn track_tunnel(&self, info: TunnelInfo);

    /// Forget a tunnel after its relay ended
    async fn close_tunnel(&self, id: Uuid);

    async fn active_tunnels(&self) -> Vec<TunnelInfo>;
}
