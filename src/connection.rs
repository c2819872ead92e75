use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

/// Anything a tunnel endpoint can be built on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncStream for T {}

/// Address of one end of a tunnel connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TunnelAddr {
    Socket(SocketAddr),
    /// A logical endpoint with no socket of its own, e.g. an HTTP/2 stream.
    Tunnel(String),
}

impl TunnelAddr {
    pub fn tunnel(address: impl Into<String>) -> Self {
        TunnelAddr::Tunnel(address.into())
    }

    pub fn unspecified() -> Self {
        TunnelAddr::Socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    pub fn network(&self) -> &'static str {
        match self {
            TunnelAddr::Socket(_) => "tcp",
            TunnelAddr::Tunnel(_) => "tunnel",
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TunnelAddr::Socket(addr) => Some(*addr),
            TunnelAddr::Tunnel(_) => None,
        }
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelAddr::Socket(addr) => write!(f, "{}", addr),
            TunnelAddr::Tunnel(address) => write!(f, "{}", address),
        }
    }
}

impl From<SocketAddr> for TunnelAddr {
    fn from(addr: SocketAddr) -> Self {
        TunnelAddr::Socket(addr)
    }
}

/// What a `TunnelConn` wraps. Decides deadline and half-close support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// A plain TCP socket, usually the upstream side of a server tunnel.
    Tcp,
    /// An HTTP/1.1 client connection taken over after a CONNECT.
    Hijacked,
    /// The request/response stream pair of a server-side HTTP/2 CONNECT.
    H2Server,
    /// The request/response stream pair of a client-side HTTP/2 CONNECT.
    H2Client,
    /// A proxy connection whose reader may hold bytes read past the CONNECT response.
    Buffered,
    /// Any other stream handed to `TunnelConn::new`.
    Custom,
}

impl ConnKind {
    /// HTTP/2 streams share one socket, so per-stream deadlines are a no-op.
    pub fn supports_deadlines(self) -> bool {
        !matches!(self, ConnKind::H2Server | ConnKind::H2Client)
    }

    pub fn supports_half_close(self) -> bool {
        !matches!(self, ConnKind::Custom)
    }
}

/// Uniform byte-stream endpoint used by the relay and returned by dialers.
///
/// `close` is idempotent. Once closed, reads and writes fail with
/// `NotConnected` and `poll_shutdown` is a no-op.
pub struct TunnelConn {
    io: Option<Box<dyn AsyncStream>>,
    kind: ConnKind,
    local: TunnelAddr,
    remote: TunnelAddr,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl TunnelConn {
    pub fn new<S>(io: S, kind: ConnKind, local: TunnelAddr, remote: TunnelAddr) -> Self
    where
        S: AsyncStream + 'static,
    {
        Self {
            io: Some(Box::new(io)),
            kind,
            local,
            remote,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self::new(stream, ConnKind::Tcp, local.into(), remote.into()))
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn local_addr(&self) -> TunnelAddr {
        self.local.clone()
    }

    pub fn remote_addr(&self) -> TunnelAddr {
        self.remote.clone()
    }

    pub fn supports_half_close(&self) -> bool {
        self.kind.supports_half_close()
    }

    pub fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    /// Sets both deadlines. `None` clears them.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        if self.kind.supports_deadlines() {
            self.read_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
        }
        Ok(())
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        if self.kind.supports_deadlines() {
            self.write_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
        }
        Ok(())
    }

    /// Shuts down the write side and releases the underlying stream.
    /// Closing twice is not an error.
    pub async fn close(&mut self) -> io::Result<()> {
        let Some(mut io) = self.io.take() else {
            return Ok(());
        };
        self.read_deadline = None;
        self.write_deadline = None;

        match io.shutdown().await {
            Err(e) if is_already_closed(&e) => Ok(()),
            other => other,
        }
    }
}

fn is_already_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tunnel connection is closed")
}

fn poll_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> io::Result<()> {
    if let Some(sleep) = deadline {
        if sleep.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "tunnel connection deadline exceeded",
            ));
        }
    }
    Ok(())
}

impl fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConn")
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = poll_deadline(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(e));
        }
        match this.io.as_mut() {
            Some(io) => Pin::new(io).poll_read(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = poll_deadline(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(e));
        }
        match this.io.as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    /// Half-close: signals end of stream to the peer and keeps the read side open.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Should bind listener");
        let addr = listener.local_addr().expect("Should have local addr");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            client.expect("Should connect"),
            accepted.expect("Should accept").0,
        )
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, mut server) = tcp_pair().await;
        let mut conn = TunnelConn::tcp(client).expect("Should wrap tcp stream");
        assert_eq!(conn.kind(), ConnKind::Tcp);
        assert_eq!(conn.remote_addr().network(), "tcp");

        conn.close().await.expect("First close should succeed");
        conn.close().await.expect("Second close should succeed");
        assert!(conn.is_closed());

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.expect_err("Read after close should fail");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let n = server.read(&mut buf).await.expect("Peer read should succeed");
        assert_eq!(n, 0, "Peer should see end of stream");
    }

    #[tokio::test]
    async fn read_deadline_times_out() {
        let (client, _server) = tcp_pair().await;
        let mut conn = TunnelConn::tcp(client).expect("Should wrap tcp stream");
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .expect("Should set deadline");

        let mut buf = [0u8; 8];
        let err = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("Deadline should fire before the outer timeout")
            .expect_err("Read should fail");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        conn.set_deadline(None).expect("Should clear deadline");
    }

    #[tokio::test]
    async fn stream_kinds_ignore_deadlines() {
        let (near, _far) = tokio::io::duplex(64);
        let mut conn = TunnelConn::new(
            near,
            ConnKind::H2Client,
            TunnelAddr::unspecified(),
            TunnelAddr::tunnel("example.com:443"),
        );
        conn.set_deadline(Some(Instant::now()))
            .expect("Deadline on a stream should be accepted");
        conn.write_all(b"still writable")
            .await
            .expect("Write should ignore the deadline");
        assert_eq!(conn.remote_addr().network(), "tunnel");
        assert_eq!(conn.remote_addr().to_string(), "example.com:443");
    }
}
