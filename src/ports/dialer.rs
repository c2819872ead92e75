use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::connection::TunnelConn;
use crate::domain::{Result, TunnelError};

/// Port for opening tunnels through a proxy
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a tunnel to `address` ("host:port").
    ///
    /// `network` must be one of "tcp", "tcp4" or "tcp6" and also selects the
    /// address family used to reach the proxy. Cancel by dropping the future.
    async fn dial_context(&self, network: &str, address: &str) -> Result<TunnelConn>;
}

pub(crate) fn check_network(network: &str) -> Result<()> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Ok(()),
        other => Err(TunnelError::UnsupportedNetwork(other.to_string())),
    }
}

type DialFn = dyn Fn(String, String) -> BoxFuture<'static, io::Result<TunnelConn>> + Send + Sync;

/// A pluggable `(network, address) -> connection` function.
///
/// Servers use it to reach targets and dialers use it to reach their proxy.
/// The default opens a TCP connection.
#[derive(Clone)]
pub struct Dial(Arc<DialFn>);

impl Dial {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<TunnelConn>> + Send + 'static,
    {
        Self(Arc::new(move |network, address| Box::pin(f(network, address))))
    }

    pub fn tcp() -> Self {
        Self::new(dial_tcp)
    }

    /// Dials through another tunnel dialer, which is how proxies are chained.
    pub fn through<D>(dialer: Arc<D>) -> Self
    where
        D: Dialer + ?Sized + 'static,
    {
        Self::new(move |network, address| {
            let dialer = dialer.clone();
            async move {
                dialer
                    .dial_context(&network, &address)
                    .await
                    .map_err(io::Error::from)
            }
        })
    }

    pub async fn dial(&self, network: &str, address: &str) -> io::Result<TunnelConn> {
        (self.0)(network.to_string(), address.to_string()).await
    }
}

impl Default for Dial {
    fn default() -> Self {
        Self::tcp()
    }
}

impl fmt::Debug for Dial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dial(..)")
    }
}

/// Resolves `address` and connects to the first reachable candidate of the
/// requested family.
pub async fn dial_tcp(network: String, address: String) -> io::Result<TunnelConn> {
    let family: fn(&std::net::SocketAddr) -> bool = match network.as_str() {
        "tcp" => |_| true,
        "tcp4" => |addr| addr.is_ipv4(),
        "tcp6" => |addr| addr.is_ipv6(),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {:?}", other),
            ))
        }
    };

    let mut last_err = None;
    for addr in lookup_host(address.as_str()).await?.filter(family) {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return TunnelConn::tcp(stream);
            }
            Err(e) => {
                debug!("connect to {} ({}) failed: {}", address, addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {} address found for {}", network, address),
        )
    }))
}
