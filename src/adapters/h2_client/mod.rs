mod stream;

pub use stream::H2Stream;

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use http::{StatusCode, Version};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::instrument::WithSubscriber;
use tracing::{debug, Instrument};

use crate::adapters::tls::{self, ALPN_H2};
use crate::config::{ClientConfig, ProxyEndpoint};
use crate::connection::{AsyncStream, ConnKind, TunnelAddr, TunnelConn};
use crate::domain::{ProxyError, ProxyOutcome, Result, TunnelError};
use crate::ports::dialer::check_network;
use crate::ports::{Dial, Dialer};

/// Opens tunnels as HTTP/2 CONNECT streams.
///
/// All tunnels of one dialer share a single proxy connection, created on
/// first use and replaced once it fails. `H2Dialer::new` speaks TLS with
/// ALPN "h2", `H2Dialer::h2c` speaks cleartext HTTP/2 with prior knowledge.
pub struct H2Dialer {
    config: ClientConfig,
    endpoint: ProxyEndpoint,
    dial: Dial,
    tls: Option<TlsConnector>,
    connection: Mutex<Option<SendRequest<Bytes>>>,
}

impl H2Dialer {
    /// Dialer for an `https` proxy URL.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = ProxyEndpoint::parse(&config.proxy_url)?;
        if !endpoint.is_tls() {
            return Err(TunnelError::InvalidProxyUrl(format!(
                "{}: HTTP/2 over TLS needs an https URL, use H2Dialer::h2c for http",
                config.proxy_url
            )));
        }
        let tls = Some(tls::connector(&config, Some(ALPN_H2)));
        Ok(Self::build(config, endpoint, tls))
    }

    /// Dialer for an `http` proxy URL that accepts HTTP/2 without TLS.
    pub fn h2c(config: ClientConfig) -> Result<Self> {
        let endpoint = ProxyEndpoint::parse(&config.proxy_url)?;
        if endpoint.is_tls() {
            return Err(TunnelError::InvalidProxyUrl(format!(
                "{}: h2c needs an http URL, use H2Dialer::new for https",
                config.proxy_url
            )));
        }
        Ok(Self::build(config, endpoint, None))
    }

    fn build(config: ClientConfig, endpoint: ProxyEndpoint, tls: Option<TlsConnector>) -> Self {
        Self {
            dial: config.dial(),
            endpoint,
            tls,
            config,
            connection: Mutex::new(None),
        }
    }

    fn server_name(&self) -> &str {
        self.config
            .server_name
            .as_deref()
            .unwrap_or(&self.endpoint.host)
    }

    /// Returns a sender on the shared proxy connection, connecting if needed.
    async fn sender(&self, network: &str) -> Result<SendRequest<Bytes>> {
        let mut connection = self.connection.lock().await;
        if let Some(sender) = connection.as_ref() {
            match sender.clone().ready().await {
                Ok(sender) => return Ok(sender),
                Err(e) => debug!("proxy connection to {} is gone: {}", self.endpoint.addr, e),
            }
        }

        let sender = self.connect(network).await?;
        *connection = Some(sender.clone());
        sender
            .ready()
            .await
            .map_err(|e| TunnelError::ProxyConnect(format!("proxy connection not ready: {}", e)))
    }

    async fn connect(&self, network: &str) -> Result<SendRequest<Bytes>> {
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

        let io: Box<dyn AsyncStream> = match &self.tls {
            Some(connector) => {
                let stream = tls::connect(connector, self.server_name(), conn).await?;
                if stream.get_ref().1.alpn_protocol() != Some(ALPN_H2) {
                    return Err(TunnelError::ProxyConnect(format!(
                        "proxy {} did not negotiate h2",
                        self.endpoint.addr
                    )));
                }
                Box::new(stream)
            }
            None => Box::new(conn),
        };

        let (sender, connection) = h2::client::handshake(io)
            .await
            .map_err(|e| TunnelError::ProxyConnect(format!("HTTP/2 handshake failed: {}", e)))?;

        let proxy = self.endpoint.addr.clone();
        tokio::spawn(
            async move {
                match connection.await {
                    Ok(()) => debug!("proxy connection closed"),
                    Err(e) => debug!("proxy connection failed: {}", e),
                }
            }
            .instrument(tracing::debug_span!("h2_proxy", %proxy))
            .with_current_subscriber(),
        );

        debug!("opened HTTP/2 connection to proxy {}", self.endpoint.addr);
        Ok(sender)
    }

    async fn open_stream(
        &self,
        mut sender: SendRequest<Bytes>,
        address: &str,
    ) -> Result<ProxyOutcome> {
        let mut request = self.config.connect_request(&self.endpoint, address)?;
        *request.version_mut() = Version::HTTP_2;

        let (response, mut send) = sender
            .send_request(request, false)
            .map_err(|e| TunnelError::ProxyConnect(format!("failed to send request: {}", e)))?;

        let outcome = match response.await {
            Ok(response) if response.status() == StatusCode::OK => {
                ProxyOutcome::Established(TunnelConn::new(
                    H2Stream::new(response.into_body(), send),
                    ConnKind::H2Client,
                    TunnelAddr::unspecified(),
                    TunnelAddr::tunnel(address),
                ))
            }
            Ok(response) => {
                send.send_reset(h2::Reason::CANCEL);
                ProxyOutcome::Rejected(ProxyError::from_status(response.status()))
            }
            Err(e) => {
                send.send_reset(h2::Reason::CANCEL);
                ProxyOutcome::TransportError(format!("failed to read response: {}", e))
            }
        };
        Ok(outcome)
    }
}

#[async_trait]
impl Dialer for H2Dialer {
    async fn dial_context(&self, network: &str, address: &str) -> Result<TunnelConn> {
        check_network(network)?;
        let sender = self.sender(network).await?;
        let conn = self.open_stream(sender, address).await?.into_result()?;
        debug!("tunnel to {} via {} established", address, self.endpoint.addr);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_check_the_scheme() {
        assert!(matches!(
            H2Dialer::new(ClientConfig::new("http://proxy:8080")),
            Err(TunnelError::InvalidProxyUrl(_))
        ));
        assert!(matches!(
            H2Dialer::h2c(ClientConfig::new("https://proxy:8443")),
            Err(TunnelError::InvalidProxyUrl(_))
        ));
        assert!(H2Dialer::new(ClientConfig::new("https://proxy:8443")).is_ok());
        assert!(H2Dialer::h2c(ClientConfig::new("http://proxy:8080")).is_ok());
    }

    #[tokio::test]
    async fn unreachable_proxy_is_a_connect_error() {
        let dialer = H2Dialer::h2c(ClientConfig::new("http://proxy.invalid:8080").with_dial_context(
            Dial::new(|_, _| async {
                Err::<TunnelConn, _>(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
            }),
        ))
        .expect("Should create dialer");

        let err = dialer
            .dial_context("tcp", "db.internal:5432")
            .await
            .expect_err("Should fail");
        assert!(matches!(err, TunnelError::ProxyConnect(_)), "got {:?}", err);
    }
}
