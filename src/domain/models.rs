use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use http::{HeaderMap, Method, Request, Version};
use uuid::Uuid;

use crate::connection::TunnelConn;
use crate::domain::errors::{ProxyError, TunnelError};

pub use http::StatusCode;

/// Socket pair of the client connection a request arrived on.
///
/// The serving layer stores it in the request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl ConnectionInfo {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelProtocol {
    Http1,
    Http2,
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelProtocol::Http1 => write!(f, "h1"),
            TunnelProtocol::Http2 => write!(f, "h2"),
        }
    }
}

/// The view of a CONNECT request handed to the tunnel policy.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub method: Method,
    /// Authority to connect to, e.g. "example.com:443".
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl TunnelRequest {
    pub fn from_request<B>(req: &Request<B>, target: impl Into<String>) -> Self {
        Self {
            method: req.method().clone(),
            target: target.into(),
            version: req.version(),
            headers: req.headers().clone(),
            remote_addr: req.extensions().get::<ConnectionInfo>().map(|i| i.remote),
        }
    }

    pub fn protocol(&self) -> TunnelProtocol {
        if self.version == Version::HTTP_2 {
            TunnelProtocol::Http2
        } else {
            TunnelProtocol::Http1
        }
    }
}

/// A tunnel the server is currently relaying.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub target: String,
    pub protocol: TunnelProtocol,
    pub remote: Option<SocketAddr>,
    pub opened_at: Instant,
}

impl TunnelInfo {
    pub fn new(request: &TunnelRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: request.target.clone(),
            protocol: request.protocol(),
            remote: request.remote_addr,
            opened_at: Instant::now(),
        }
    }
}

/// How a CONNECT handshake with a proxy ended.
#[derive(Debug)]
pub enum ProxyOutcome {
    Established(TunnelConn),
    Rejected(ProxyError),
    TransportError(String),
}

impl ProxyOutcome {
    pub fn into_result(self) -> Result<TunnelConn, TunnelError> {
        match self {
            ProxyOutcome::Established(conn) => Ok(conn),
            ProxyOutcome::Rejected(e) => Err(TunnelError::Proxy(e)),
            ProxyOutcome::TransportError(msg) => Err(TunnelError::ProxyConnect(msg)),
        }
    }
}
