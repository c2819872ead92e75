#![cfg(test)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use connect_tunnel::{ProxyServer, TunnelHandler};

use super::tls_fixture::TestCertificate;

/// A `ProxyServer` on an ephemeral port, stopped on drop.
pub struct TestTunnelServer {
    addr: SocketAddr,
    handler: TunnelHandler,
    shutdown: CancellationToken,
    _server_handle: JoinHandle<()>,
}

impl TestTunnelServer {
    pub async fn start(handler: TunnelHandler) -> Result<Self, Box<dyn std::error::Error>> {
        let server = ProxyServer::bind("127.0.0.1:0", handler.clone()).await?;
        Ok(Self::run(server, handler))
    }

    pub async fn start_tls(
        handler: TunnelHandler,
        certificate: &TestCertificate,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let server = ProxyServer::bind("127.0.0.1:0", handler.clone())
            .await?
            .with_tls(certificate.acceptor());
        Ok(Self::run(server, handler))
    }

    fn run(server: ProxyServer, handler: TunnelHandler) -> Self {
        let addr = server.local_addr().expect("Should have local addr");
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let server_handle = tokio::spawn(async move {
            let _ = server.run(token).await;
        });

        Self {
            addr,
            handler,
            shutdown,
            _server_handle: server_handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn https_url(&self) -> String {
        format!("https://{}", self.addr)
    }

    pub fn handler(&self) -> &TunnelHandler {
        &self.handler
    }

    /// Waits until the handler reports `count` open tunnels.
    pub async fn wait_for_tunnels(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if self.handler.active_tunnels().await.len() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for TestTunnelServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handler.shutdown();
    }
}
