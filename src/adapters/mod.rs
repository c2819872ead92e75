pub mod h1_client;
pub mod h2_client;
pub mod hyper_server;
pub mod tls;
pub mod tracking;

pub use h1_client::H1Dialer;
pub use h2_client::{H2Dialer, H2Stream};
pub use hyper_server::{serve_connection, ProxyServer, TunnelHandler};
pub use tracking::TunnelTracker;
