use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::adapter::TunnelHandler;
use crate::domain::{BoxError, ConnectionInfo};

/// Serves one client connection with `handler`.
///
/// HTTP/1.1 and HTTP/2 are both accepted. Without TLS, HTTP/2 is detected
/// from the prior-knowledge preface (h2c).
pub async fn serve_connection<I>(
    io: I,
    info: ConnectionInfo,
    handler: TunnelHandler,
) -> Result<(), BoxError>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let service = service_fn(move |mut req: Request<Incoming>| {
        let handler = handler.clone();
        req.extensions_mut().insert(info);
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    // A successful CONNECT answer is the bare status line and a blank line.
    let mut builder = ServerBuilder::new(TokioExecutor::new());
    builder.http1().auto_date_header(false);
    builder
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
}

/// Accept loop feeding a `TunnelHandler`, optionally behind TLS.
pub struct ProxyServer {
    listener: TcpListener,
    handler: TunnelHandler,
    tls: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub async fn bind(addr: impl ToSocketAddrs, handler: TunnelHandler) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, handler))
    }

    pub fn from_listener(listener: TcpListener, handler: TunnelHandler) -> Self {
        Self {
            listener,
            handler,
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handler(&self) -> &TunnelHandler {
        &self.handler
    }

    /// Accepts connections until `shutdown` fires. Open tunnels are left to
    /// `TunnelHandler::shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let local = self.listener.local_addr()?;
        info!(
            "listening on {}{}",
            local,
            if self.tls.is_some() { " (tls)" } else { "" }
        );

        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);
            let info = ConnectionInfo::new(stream.local_addr().unwrap_or(local), remote);
            let handler = self.handler.clone();
            let tls = self.tls.clone();

            tokio::spawn(
                async move {
                    let served = match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => serve_connection(stream, info, handler).await,
                            Err(e) => {
                                debug!("TLS handshake failed: {}", e);
                                return;
                            }
                        },
                        None => serve_connection(stream, info, handler).await,
                    };
                    if let Err(e) = served {
                        debug!("connection ended with error: {}", e);
                    }
                }
                .instrument(debug_span!("conn", peer = %remote)),
            );
        }

        info!("stopped listening on {}", local);
        Ok(())
    }
}
