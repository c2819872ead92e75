#![cfg(test)]
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod echo_server;
pub mod tls_fixture;
pub mod tunnel_server;

pub use echo_server::EchoServer;
pub use tls_fixture::TestCertificate;
pub use tunnel_server::TestTunnelServer;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use connect_tunnel::TunnelConn;

/// Sends `message` through `conn` and checks the echo comes back.
pub async fn assert_echo(conn: &mut TunnelConn, message: &[u8]) {
    conn.write_all(message)
        .await
        .expect("Should write through the tunnel");
    let mut reply = vec![0u8; message.len()];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut reply))
        .await
        .expect("Echo should arrive within timeout")
        .expect("Should read echo");
    assert_eq!(reply, message);
}
