//! TCP tunnels over HTTP CONNECT.
//!
//! The server side is [`TunnelHandler`], a hyper request handler that accepts
//! CONNECT over HTTP/1.1, HTTP/2 and h2c, dials the target and relays bytes.
//! The client side is the [`Dialer`] trait with [`H1Dialer`] and
//! [`H2Dialer`], which return a [`TunnelConn`] through a proxy. Dialers nest
//! through [`Dial::through`] to chain proxies.
//!
//! ```no_run
//! use connect_tunnel::{ClientConfig, Dialer, H1Dialer};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dialer = H1Dialer::new(ClientConfig::new("http://proxy.internal:3128"))?;
//! let mut conn = dialer.dial_context("tcp", "db.internal:5432").await?;
//! conn.write_all(b"hello").await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod connection;
pub mod domain;
pub mod ports;

pub use adapters::{H1Dialer, H2Dialer, ProxyServer, TunnelHandler};
pub use config::{ClientConfig, ServerConfig};
pub use connection::{ConnKind, TunnelAddr, TunnelConn};
pub use domain::{relay, ProxyError, Transfer, TunnelError, TunnelRequest};
pub use ports::{Dial, Dialer, TunnelPolicy};
