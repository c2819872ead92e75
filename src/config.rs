use std::fmt;
use std::sync::Arc;

use base64::prelude::*;
use http::header::{HeaderName, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, Request, Uri};
use url::{Host, Url};

use crate::domain::{BoxError, Result, TunnelError, TunnelRequest};
use crate::ports::{Dial, TrackingPort, TunnelPolicy};

/// Settings for `TunnelHandler`. Every field is optional.
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Consulted before dialing. No policy accepts every tunnel.
    pub on_tunnel: Option<Arc<dyn TunnelPolicy>>,
    /// How targets are reached. Defaults to TCP.
    pub dial: Dial,
    /// Dispatcher for the handler's events. Falls back to the global one.
    pub logger: Option<tracing::Dispatch>,
    /// Registry of open tunnels. Defaults to an in-memory tracker.
    pub tracker: Option<Arc<dyn TrackingPort>>,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: impl TunnelPolicy + 'static) -> Self {
        self.on_tunnel = Some(Arc::new(policy));
        self
    }

    /// Same as `with_policy`, for a plain closure.
    pub fn with_tunnel_fn<F>(self, f: F) -> Self
    where
        F: Fn(&TunnelRequest) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.with_policy(f)
    }

    pub fn with_dial(mut self, dial: Dial) -> Self {
        self.dial = dial;
        self
    }

    pub fn with_logger(mut self, logger: impl Into<tracing::Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn TrackingPort>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub(crate) async fn check_tunnel(
        &self,
        request: &TunnelRequest,
    ) -> std::result::Result<(), BoxError> {
        match &self.on_tunnel {
            Some(policy) => policy.check(request).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("on_tunnel", &self.on_tunnel.is_some())
            .field("dial", &self.dial)
            .field("logger", &self.logger.is_some())
            .field("tracker", &self.tracker.is_some())
            .finish()
    }
}

/// Computes extra headers for each CONNECT request a dialer sends.
pub type HeadersFn =
    Arc<dyn Fn(&Request<()>) -> std::result::Result<HeaderMap, BoxError> + Send + Sync>;

/// Settings shared by `H1Dialer` and `H2Dialer`.
#[derive(Clone)]
pub struct ClientConfig {
    /// `http://` or `https://`, with an optional `user:password@` for Basic
    /// proxy authentication. Default ports are 80 and 443.
    pub proxy_url: String,
    /// TLS settings for `https` proxies. Defaults to the webpki roots.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Name to verify the proxy certificate against. Defaults to the URL host.
    pub server_name: Option<String>,
    /// Sent with every CONNECT request.
    pub headers: HeaderMap,
    /// Called for every CONNECT request. Its headers override `headers`.
    pub headers_for_request: Option<HeadersFn>,
    /// How the proxy itself is reached. Defaults to TCP.
    pub dial_context: Option<Dial>,
}

impl ClientConfig {
    pub fn new(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            tls_config: None,
            server_name: None,
            headers: HeaderMap::new(),
            headers_for_request: None,
            dial_context: None,
        }
    }

    pub fn with_tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request<()>) -> std::result::Result<HeaderMap, BoxError> + Send + Sync + 'static,
    {
        self.headers_for_request = Some(Arc::new(f));
        self
    }

    pub fn with_dial_context(mut self, dial: Dial) -> Self {
        self.dial_context = Some(dial);
        self
    }

    pub(crate) fn dial(&self) -> Dial {
        self.dial_context.clone().unwrap_or_default()
    }

    /// Builds the CONNECT request for `address` with every configured header.
    pub(crate) fn connect_request(
        &self,
        endpoint: &ProxyEndpoint,
        address: &str,
    ) -> Result<Request<()>> {
        let uri: Uri = address.parse().map_err(|_| TunnelError::InvalidTarget)?;
        if uri.authority().is_none() || uri.scheme().is_some() {
            return Err(TunnelError::InvalidTarget);
        }

        let mut request = Request::connect(uri)
            .body(())
            .map_err(|e| TunnelError::ProxyConnect(format!("failed to build request: {}", e)))?;

        let headers = request.headers_mut();
        headers.extend(self.headers.clone());
        if let Some(authorization) = &endpoint.authorization {
            if !headers.contains_key(PROXY_AUTHORIZATION) {
                headers.insert(PROXY_AUTHORIZATION, authorization.clone());
            }
        }

        if let Some(headers_for_request) = &self.headers_for_request {
            let extra = headers_for_request(&request).map_err(|e| {
                TunnelError::ProxyConnect(format!("failed to get additional headers: {}", e))
            })?;
            request.headers_mut().extend(extra);
        }

        Ok(request)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("proxy_url", &self.proxy_url)
            .field("server_name", &self.server_name)
            .field("headers", &self.headers)
            .field("headers_for_request", &self.headers_for_request.is_some())
            .field("dial_context", &self.dial_context.is_some())
            .finish()
    }
}

/// A parsed proxy URL.
#[derive(Debug, Clone)]
pub(crate) struct ProxyEndpoint {
    pub scheme: String,
    /// Host without brackets, used as the default TLS server name.
    pub host: String,
    /// "host:port" to dial.
    pub addr: String,
    pub authorization: Option<HeaderValue>,
}

impl ProxyEndpoint {
    pub(crate) fn parse(proxy_url: &str) -> Result<Self> {
        let url = Url::parse(proxy_url)
            .map_err(|e| TunnelError::InvalidProxyUrl(format!("{}: {}", proxy_url, e)))?;

        let scheme = url.scheme().to_string();
        let default_port = match scheme.as_str() {
            "http" => 80,
            "https" => 443,
            other => {
                return Err(TunnelError::InvalidProxyUrl(format!(
                    "unsupported scheme {:?}",
                    other
                )))
            }
        };
        let port = url.port().unwrap_or(default_port);

        let (host, addr) = match url.host() {
            Some(Host::Domain(domain)) => (domain.to_string(), format!("{}:{}", domain, port)),
            Some(Host::Ipv4(ip)) => (ip.to_string(), format!("{}:{}", ip, port)),
            Some(Host::Ipv6(ip)) => (ip.to_string(), format!("[{}]:{}", ip, port)),
            None => {
                return Err(TunnelError::InvalidProxyUrl(format!(
                    "{}: missing host",
                    proxy_url
                )))
            }
        };

        let authorization = if url.username().is_empty() {
            None
        } else {
            Some(basic_auth(url.username(), url.password().unwrap_or(""))?)
        };

        Ok(Self {
            scheme,
            host,
            addr,
            authorization,
        })
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

fn basic_auth(username: &str, password: &str) -> Result<HeaderValue> {
    let encoded = BASE64_STANDARD.encode(format!("{}:{}", username, password));
    HeaderValue::from_str(&format!("Basic {}", encoded))
        .map_err(|e| TunnelError::InvalidProxyUrl(format!("invalid credentials: {}", e)))
}
