use std::time::Duration;

use async_trait::async_trait;
use http::header::HOST;
use http::Request;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::adapters::tls;
use crate::config::{ClientConfig, ProxyEndpoint};
use crate::connection::{AsyncStream, ConnKind, TunnelAddr, TunnelConn};
use crate::domain::{ProxyError, ProxyOutcome, Result, TunnelError};
use crate::ports::dialer::check_network;
use crate::ports::{Dial, Dialer};

const MAX_RESPONSE_HEAD: usize = 64 * 1024;
const MAX_REJECTION_BODY: usize = 4 * 1024;
const REJECTION_BODY_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens tunnels with an HTTP/1.1 CONNECT, one proxy connection per tunnel.
///
/// `https` proxy URLs are reached over TLS. The returned connection keeps
/// any bytes the proxy sent right after its response.
pub struct H1Dialer {
    config: ClientConfig,
    endpoint: ProxyEndpoint,
    dial: Dial,
    tls: Option<TlsConnector>,
}

impl H1Dialer {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = ProxyEndpoint::parse(&config.proxy_url)?;
        let tls = endpoint.is_tls().then(|| tls::connector(&config, None));
        Ok(Self {
            dial: config.dial(),
            endpoint,
            tls,
            config,
        })
    }

    fn server_name(&self) -> &str {
        self.config
            .server_name
            .as_deref()
            .unwrap_or(&self.endpoint.host)
    }
}

#[async_trait]
impl Dialer for H1Dialer {
    async fn dial_context(&self, network: &str, address: &str) -> Result<TunnelConn> {
        check_network(network)?;
        let request = self.config.connect_request(&self.endpoint, address)?;
        let head = encode_request(&request);

        let conn = self
            .dial
            .dial(network, &self.endpoint.addr)
            .await
            .map_err(|e| {
                TunnelError::ProxyConnect(format!(
                    "failed to dial proxy {}: {}",
                    self.endpoint.addr, e
                ))
            })?;
        let local = conn.local_addr();
        let remote = conn.remote_addr();

        let outcome = match &self.tls {
            Some(connector) => {
                let stream = tls::connect(connector, self.server_name(), conn).await?;
                handshake(stream, &head, local, remote).await
            }
            None => handshake(conn, &head, local, remote).await,
        };

        let conn = outcome.into_result()?;
        debug!("tunnel to {} via {} established", address, self.endpoint.addr);
        Ok(conn)
    }
}

fn encode_request(request: &Request<()>) -> Vec<u8> {
    let target = request.uri().to_string();
    let mut head = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target).into_bytes();
    for (name, value) in request.headers() {
        if name == HOST {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Sends a CONNECT request head over `stream` and reads the proxy's answer.
pub(crate) async fn handshake<S>(
    mut stream: S,
    head: &[u8],
    local: TunnelAddr,
    remote: TunnelAddr,
) -> ProxyOutcome
where
    S: AsyncStream + 'static,
{
    let written = async {
        stream.write_all(head).await?;
        stream.flush().await
    };
    if let Err(e) = written.await {
        return ProxyOutcome::TransportError(format!("failed to write request: {}", e));
    }

    let mut reader = BufReader::new(stream);
    let response = match read_response_head(&mut reader).await {
        Ok(response) => response,
        Err(e) => return ProxyOutcome::TransportError(format!("failed to read response: {}", e)),
    };

    if response.code == 200 {
        // The reader may already hold tunnel bytes, so it becomes the connection.
        return ProxyOutcome::Established(TunnelConn::new(
            reader,
            ConnKind::Buffered,
            local,
            remote,
        ));
    }

    let mut rejection = ProxyError::new(response.code, response.status);
    if let Some(len) = response
        .content_length
        .filter(|len| (1..=MAX_REJECTION_BODY).contains(len))
    {
        let mut body = vec![0u8; len];
        if let Ok(Ok(_)) =
            tokio::time::timeout(REJECTION_BODY_TIMEOUT, reader.read_exact(&mut body)).await
        {
            let message = String::from_utf8_lossy(&body).trim().to_string();
            if !message.is_empty() {
                rejection = rejection.with_message(message);
            }
        }
    }
    let _ = reader.get_mut().shutdown().await;
    ProxyOutcome::Rejected(rejection)
}

#[derive(Debug)]
struct ResponseHead {
    code: u16,
    status: String,
    content_length: Option<usize>,
}

async fn read_response_head<R>(reader: &mut R) -> std::result::Result<ResponseHead, String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut consumed = read_head_line(reader, &mut line, MAX_RESPONSE_HEAD).await?;
    if consumed == 0 {
        return Err("unexpected end of stream".to_string());
    }

    let status_line = String::from_utf8_lossy(&line).trim_end().to_string();
    let malformed = || format!("malformed status line {:?}", status_line);
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next().is_some_and(|v| v.starts_with("HTTP/1.")) {
        return Err(malformed());
    }
    let code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .filter(|c| (100..1000).contains(c))
        .ok_or_else(malformed)?;
    let status = match parts.next().map(str::trim) {
        Some(reason) if !reason.is_empty() => format!("{} {}", code, reason),
        _ => code.to_string(),
    };

    let mut content_length = None;
    loop {
        let n = read_head_line(reader, &mut line, MAX_RESPONSE_HEAD - consumed).await?;
        if n == 0 {
            return Err("unexpected end of stream in headers".to_string());
        }
        consumed += n;

        let header = String::from_utf8_lossy(&line);
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    Ok(ResponseHead {
        code,
        status,
        content_length,
    })
}

/// Reads one line into `line`, never pulling more than `budget` bytes off
/// `reader`.
async fn read_head_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    budget: usize,
) -> std::result::Result<usize, String>
where
    R: AsyncBufRead + Unpin,
{
    const TOO_LARGE: &str = "response head too large";

    line.clear();
    if budget == 0 {
        return Err(TOO_LARGE.to_string());
    }
    let n = (&mut *reader)
        .take(budget as u64)
        .read_until(b'\n', line)
        .await
        .map_err(|e| e.to_string())?;
    if n == budget && !line.ends_with(b"\n") {
        return Err(TOO_LARGE.to_string());
    }
    Ok(n)
}
