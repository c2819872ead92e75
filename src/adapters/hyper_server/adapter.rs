use std::future::Future;
use std::sync::Arc;

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, Version};
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::adapters::tracking::TunnelTracker;
use crate::config::ServerConfig;
use crate::connection::{ConnKind, TunnelAddr, TunnelConn};
use crate::domain::{relay, ConnectionInfo, TunnelError, TunnelInfo, TunnelRequest};
use crate::ports::TrackingPort;

pub type Body = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unified,
    Http1,
    Http2,
}

/// Serves CONNECT requests by dialing the target and relaying bytes between
/// the client and the target.
///
/// HTTP/1.1 tunnels take over the client connection after a
/// "200 Connection Established". HTTP/2 tunnels use the CONNECT stream.
#[derive(Clone)]
pub struct TunnelHandler {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    mode: Mode,
    tracker: Arc<dyn TrackingPort>,
    shutdown: CancellationToken,
}

impl TunnelHandler {
    /// Handles both protocols, picking per request version.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_mode(config, Mode::Unified)
    }

    /// HTTP/1.1 only.
    pub fn h1(config: ServerConfig) -> Self {
        Self::with_mode(config, Mode::Http1)
    }

    /// HTTP/2 only. Older protocol versions get a 505.
    pub fn h2(config: ServerConfig) -> Self {
        Self::with_mode(config, Mode::Http2)
    }

    fn with_mode(config: ServerConfig, mode: Mode) -> Self {
        let tracker = config
            .tracker
            .clone()
            .unwrap_or_else(|| Arc::new(TunnelTracker::new()));
        Self {
            inner: Arc::new(Inner {
                config,
                mode,
                tracker,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Cancels every tunnel started by this handler, including future ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub async fn active_tunnels(&self) -> Vec<TunnelInfo> {
        self.inner.tracker.active_tunnels().await
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: Send + 'static,
    {
        match &self.inner.config.logger {
            Some(logger) => self.dispatch(req).with_subscriber(logger.clone()).await,
            None => self.dispatch(req).await,
        }
    }

    async fn dispatch<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: Send + 'static,
    {
        let result = match self.inner.mode {
            Mode::Unified if req.method() != Method::CONNECT => Err(TunnelError::InvalidMethod),
            Mode::Unified if req.version() == Version::HTTP_2 => self.accept_h2(req).await,
            Mode::Unified | Mode::Http1 => self.accept_h1(req).await,
            Mode::Http2 => self.accept_h2(req).await,
        };

        result.unwrap_or_else(|e| {
            match &e {
                TunnelError::InvalidMethod
                | TunnelError::InvalidTarget
                | TunnelError::HttpVersionNotSupported
                | TunnelError::ShuttingDown => debug!("{}", e),
                TunnelError::TunnelRejected(_) | TunnelError::UpstreamDial(_) => warn!("{}", e),
                _ => error!("{}", e),
            }
            error_response(&e)
        })
    }

    async fn accept_h1<B>(&self, mut req: Request<B>) -> Result<Response<Body>, TunnelError>
    where
        B: Send + 'static,
    {
        if req.method() != Method::CONNECT {
            return Err(TunnelError::InvalidMethod);
        }
        let target = connect_target(&req)?;
        let request = TunnelRequest::from_request(&req, target.as_str());
        let mut upstream = self.open_upstream(&request).await?;

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            let _ = upstream.close().await;
            return Err(TunnelError::HijackFailed(
                "connection does not support hijacking".to_string(),
            ));
        };
        let (local, remote) = match req.extensions().get::<ConnectionInfo>() {
            Some(info) => (TunnelAddr::Socket(info.local), TunnelAddr::Socket(info.remote)),
            None => (TunnelAddr::unspecified(), TunnelAddr::unspecified()),
        };

        self.spawn_tunnel(request, upstream, async move {
            let upgraded = on_upgrade
                .await
                .map_err(|e| TunnelError::HijackFailed(e.to_string()))?;
            Ok(TunnelConn::new(
                TokioIo::new(upgraded),
                ConnKind::Hijacked,
                local,
                remote,
            ))
        });

        let mut response = Response::new(empty());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }

    async fn accept_h2<B>(&self, mut req: Request<B>) -> Result<Response<Body>, TunnelError>
    where
        B: Send + 'static,
    {
        if req.version() != Version::HTTP_2 {
            return Err(TunnelError::HttpVersionNotSupported);
        }
        if req.method() != Method::CONNECT {
            return Err(TunnelError::InvalidMethod);
        }
        let target = connect_target(&req)?;
        let request = TunnelRequest::from_request(&req, target.as_str());
        let mut upstream = self.open_upstream(&request).await?;

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            let _ = upstream.close().await;
            return Err(TunnelError::HijackFailed(
                "stream does not support full-duplex bodies".to_string(),
            ));
        };

        self.spawn_tunnel(request, upstream, async move {
            let upgraded = on_upgrade
                .await
                .map_err(|e| TunnelError::HijackFailed(e.to_string()))?;
            Ok(TunnelConn::new(
                TokioIo::new(upgraded),
                ConnKind::H2Server,
                TunnelAddr::unspecified(),
                TunnelAddr::tunnel(target),
            ))
        });

        Ok(Response::new(empty()))
    }

    /// Runs the policy, then dials the target.
    async fn open_upstream(&self, request: &TunnelRequest) -> Result<TunnelConn, TunnelError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TunnelError::ShuttingDown);
        }
        self.inner
            .config
            .check_tunnel(request)
            .await
            .map_err(TunnelError::TunnelRejected)?;

        self.inner
            .config
            .dial
            .dial("tcp", &request.target)
            .await
            .map_err(TunnelError::UpstreamDial)
    }

    /// Relays between the client stream produced by `client` and `upstream`
    /// in a background task.
    fn spawn_tunnel<F>(&self, request: TunnelRequest, mut upstream: TunnelConn, client: F)
    where
        F: Future<Output = Result<TunnelConn, TunnelError>> + Send + 'static,
    {
        let info = TunnelInfo::new(&request);
        let span = info_span!("tunnel", id = %info.id, target = %info.target, proto = %info.protocol);
        let tracker = self.inner.tracker.clone();
        let cancel = self.inner.shutdown.child_token();

        let task = async move {
            let id = info.id;
            tracker.track_tunnel(info).await;
            match client.await {
                Ok(client) => {
                    relay(client, upstream, cancel).await;
                }
                Err(e) => {
                    error!("{}", e);
                    let _ = upstream.close().await;
                }
            }
            tracker.close_tunnel(id).await;
        }
        .instrument(span);

        match &self.inner.config.logger {
            Some(logger) => tokio::spawn(task.with_subscriber(logger.clone())),
            None => tokio::spawn(task.with_current_subscriber()),
        };
    }
}

fn connect_target<B>(req: &Request<B>) -> Result<String, TunnelError> {
    req.uri()
        .authority()
        .map(|authority| authority.as_str())
        .filter(|authority| !authority.is_empty())
        .map(str::to_string)
        .ok_or(TunnelError::InvalidTarget)
}

fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn error_response(e: &TunnelError) -> Response<Body> {
    let body = Full::new(Bytes::from(format!("{}\n", e.public_message())))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = e.status_code();
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}
