use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::ClientConfig;
use crate::domain::{Result, TunnelError};

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Client TLS settings trusting the webpki root set.
pub fn default_client_config() -> Arc<rustls::ClientConfig> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Server TLS settings offering h2 and http/1.1 over ALPN.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> std::result::Result<Arc<rustls::ServerConfig>, rustls::Error> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    Ok(Arc::new(config))
}

pub fn acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> std::result::Result<TlsAcceptor, rustls::Error> {
    Ok(TlsAcceptor::from(server_config(certs, key)?))
}

/// Connector for a proxy. With `alpn` set, only that protocol is offered.
pub(crate) fn connector(config: &ClientConfig, alpn: Option<&[u8]>) -> TlsConnector {
    let base = config
        .tls_config
        .clone()
        .unwrap_or_else(default_client_config);
    let tls = match alpn {
        Some(protocol) => {
            let mut tls = (*base).clone();
            tls.alpn_protocols = vec![protocol.to_vec()];
            Arc::new(tls)
        }
        None => base,
    };
    TlsConnector::from(tls)
}

pub(crate) async fn connect<S>(
    connector: &TlsConnector,
    server_name: &str,
    stream: S,
) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
        TunnelError::ProxyConnect(format!("invalid server name {:?}: {}", server_name, e))
    })?;
    connector
        .connect(name, stream)
        .await
        .map_err(|e| TunnelError::ProxyConnect(format!("TLS handshake with proxy failed: {}", e)))
}
