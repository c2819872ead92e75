use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use connect_tunnel::adapters::tls;
use connect_tunnel::{ProxyServer, ServerConfig, TunnelHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// HTTP/1.1 and HTTP/2, chosen per request
    Unified,
    /// HTTP/1.1 CONNECT only
    H1,
    /// HTTP/2 CONNECT only
    H2,
}

#[derive(Parser, Debug)]
#[command(version = env!("CONNECT_TUNNEL_VERSION"), about = "HTTP CONNECT tunneling proxy")]
struct Opts {
    /// listen on this network address
    #[arg(long, short = 'b', default_value = "127.0.0.1:8080")]
    bind: String,

    /// PEM certificate chain, enables TLS
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// which CONNECT flavours to accept
    #[arg(long, value_enum, default_value_t = Mode::Unified)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Opts::parse();
    info!("connect-proxy {}", env!("CONNECT_TUNNEL_VERSION"));

    let config = ServerConfig::new();
    let handler = match opts.mode {
        Mode::Unified => TunnelHandler::new(config),
        Mode::H1 => TunnelHandler::h1(config),
        Mode::H2 => TunnelHandler::h2(config),
    };

    let mut server = ProxyServer::bind(&opts.bind, handler.clone()).await?;
    if let (Some(cert), Some(key)) = (&opts.tls_cert, &opts.tls_key) {
        server = server.with_tls(load_acceptor(cert, key)?);
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutting down"),
            Err(e) => {
                error!("failed to listen for ctrl-c: {}", e);
                return;
            }
        }
        signal.cancel();
    });

    server.run(shutdown).await?;
    handler.shutdown();
    Ok(())
}

fn load_acceptor(cert: &Path, key: &Path) -> Result<tokio_rustls::TlsAcceptor, Box<dyn Error>> {
    let certs = CertificateDer::pem_file_iter(cert)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(key)?;
    Ok(tls::acceptor(certs, key)?)
}
