use std::fmt;
use std::io;

use http::StatusCode;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A non-200 answer from a proxy to our CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyError {
    pub status_code: u16,
    /// Status line text, e.g. "403 Forbidden".
    pub status: String,
    pub message: Option<String>,
}

impl ProxyError {
    pub fn new(status_code: u16, status: impl Into<String>) -> Self {
        Self {
            status_code,
            status: status.into(),
            message: None,
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        let text = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };
        Self::new(status.as_u16(), text)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect-tunnel: proxy returned {}", self.status)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProxyError {}

#[derive(Debug)]
pub enum TunnelError {
    /// The request method is not CONNECT.
    InvalidMethod,
    /// The CONNECT request carries no target authority.
    InvalidTarget,
    /// An HTTP/2-only handler received an older protocol version.
    HttpVersionNotSupported,
    /// The tunnel policy refused the request.
    TunnelRejected(BoxError),
    /// The server could not reach the requested target.
    UpstreamDial(io::Error),
    /// The client connection could not be taken over as a raw byte stream.
    HijackFailed(String),
    /// Transport failure while talking to a proxy (dial, TLS, write, read).
    ProxyConnect(String),
    /// The proxy answered with something other than 200.
    Proxy(ProxyError),
    UnsupportedNetwork(String),
    InvalidProxyUrl(String),
    /// The handler was shut down and accepts no new tunnels.
    ShuttingDown,
}

impl TunnelError {
    /// HTTP status a server handler answers with for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TunnelError::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
            TunnelError::InvalidTarget => StatusCode::BAD_REQUEST,
            TunnelError::HttpVersionNotSupported => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            TunnelError::TunnelRejected(_) => StatusCode::FORBIDDEN,
            TunnelError::UpstreamDial(_) => StatusCode::BAD_GATEWAY,
            TunnelError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text body sent alongside `status_code`.
    pub fn public_message(&self) -> &'static str {
        match self {
            TunnelError::InvalidMethod => "Method not allowed",
            TunnelError::InvalidTarget => "Bad request: missing target",
            TunnelError::HttpVersionNotSupported => "HTTP/2 required",
            TunnelError::TunnelRejected(_) => "Forbidden",
            TunnelError::UpstreamDial(_) => "Bad Gateway",
            TunnelError::ShuttingDown => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    pub fn is_proxy_rejection(&self) -> bool {
        matches!(self, TunnelError::Proxy(_))
    }

    pub fn proxy_error(&self) -> Option<&ProxyError> {
        match self {
            TunnelError::Proxy(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::InvalidMethod => write!(f, "connect-tunnel: method must be CONNECT"),
            TunnelError::InvalidTarget => write!(f, "connect-tunnel: missing or invalid target"),
            TunnelError::HttpVersionNotSupported => {
                write!(f, "connect-tunnel: HTTP/2 required")
            }
            TunnelError::TunnelRejected(e) => write!(f, "connect-tunnel: tunnel rejected: {}", e),
            TunnelError::UpstreamDial(e) => {
                write!(f, "connect-tunnel: failed to dial upstream: {}", e)
            }
            TunnelError::HijackFailed(msg) => {
                write!(f, "connect-tunnel: failed to hijack connection: {}", msg)
            }
            TunnelError::ProxyConnect(msg) => {
                write!(f, "connect-tunnel: proxy connect failed: {}", msg)
            }
            TunnelError::Proxy(e) => write!(f, "{}", e),
            TunnelError::UnsupportedNetwork(network) => {
                write!(f, "connect-tunnel: unsupported network {:?}", network)
            }
            TunnelError::InvalidProxyUrl(msg) => {
                write!(f, "connect-tunnel: invalid proxy URL: {}", msg)
            }
            TunnelError::ShuttingDown => write!(f, "connect-tunnel: handler is shutting down"),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunnelError::TunnelRejected(e) => Some(e.as_ref()),
            TunnelError::UpstreamDial(e) => Some(e),
            TunnelError::Proxy(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProxyError> for TunnelError {
    fn from(e: ProxyError) -> Self {
        TunnelError::Proxy(e)
    }
}

/// Lets dialers be used wherever an `io::Result` dial function is expected.
/// The `TunnelError` stays reachable through `get_ref()`.
impl From<TunnelError> for io::Error {
    fn from(e: TunnelError) -> Self {
        let kind = match &e {
            TunnelError::Proxy(_) => io::ErrorKind::ConnectionRefused,
            TunnelError::UnsupportedNetwork(_)
            | TunnelError::InvalidProxyUrl(_)
            | TunnelError::InvalidTarget => io::ErrorKind::InvalidInput,
            TunnelError::UpstreamDial(inner) => inner.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_error_display_includes_status() {
        let err = ProxyError::from_status(StatusCode::FORBIDDEN);
        assert_eq!(err.status_code, 403);
        assert_eq!(err.to_string(), "connect-tunnel: proxy returned 403 Forbidden");

        let err = err.with_message("denied by policy");
        assert_eq!(
            err.to_string(),
            "connect-tunnel: proxy returned 403 Forbidden: denied by policy"
        );
    }

    #[test]
    fn handler_status_mapping() {
        assert_eq!(TunnelError::InvalidMethod.status_code(), 405);
        assert_eq!(TunnelError::InvalidTarget.status_code(), 400);
        assert_eq!(TunnelError::TunnelRejected("no".into()).status_code(), 403);
        assert_eq!(
            TunnelError::UpstreamDial(io::ErrorKind::ConnectionRefused.into()).status_code(),
            502
        );
        assert_eq!(TunnelError::HijackFailed("x".into()).status_code(), 500);
        assert_eq!(TunnelError::HttpVersionNotSupported.status_code(), 505);
        assert_eq!(TunnelError::ShuttingDown.status_code(), 503);
        assert_eq!(TunnelError::TunnelRejected("no".into()).public_message(), "Forbidden");
    }

    #[test]
    fn io_error_keeps_tunnel_error() {
        let rejection = ProxyError::new(407, "407 Proxy Authentication Required");
        let err: io::Error = TunnelError::Proxy(rejection).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<TunnelError>())
            .expect("Should keep the tunnel error");
        assert_eq!(inner.proxy_error().map(|p| p.status_code), Some(407));
    }
}
