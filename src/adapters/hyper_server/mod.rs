mod adapter;
mod server;

pub use adapter::{Body, TunnelHandler};
pub use server::{serve_connection, ProxyServer};
