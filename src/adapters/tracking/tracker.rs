use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::TunnelInfo;
use crate::ports::TrackingPort;

/// In-memory registry of open tunnels
pub struct TunnelTracker {
    tunnels: Arc<RwLock<HashMap<Uuid, TunnelInfo>>>,
}

impl TunnelTracker {
    pub fn new() -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for TunnelTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackingPort for TunnelTracker {
    async fn track_tunnel(&self, info: TunnelInfo) {
        match info.remote {
            Some(remote) => info!("CONNECT {} ({} from {})", info.target, info.protocol, remote),
            None => info!("CONNECT {} ({})", info.target, info.protocol),
        }

        let mut tunnels = self.tunnels.write().await;
        tunnels.insert(info.id, info);
    }

    async fn close_tunnel(&self, id: Uuid) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(info) = tunnels.remove(&id) {
            debug!(
                "closed tunnel to {} after {:?}",
                info.target,
                info.opened_at.elapsed()
            );
        }
    }

    async fn active_tunnels(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.read().await;
        let mut active: Vec<TunnelInfo> = tunnels.values().cloned().collect();
        active.sort_by_key(|t| t.opened_at);
        active
    }
}
