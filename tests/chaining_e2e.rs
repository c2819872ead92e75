mod e2e_utils;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use connect_tunnel::ports::dialer::dial_tcp;
use connect_tunnel::{
    ClientConfig, Dial, Dialer, H1Dialer, H2Dialer, ServerConfig, TunnelConn, TunnelHandler,
};
use e2e_utils::{assert_echo, EchoServer, TestCertificate, TestTunnelServer};

/// Dial function that only reaches `allowed`.
fn restricted_dial(allowed: SocketAddr) -> Dial {
    let allowed = allowed.to_string();
    Dial::new(move |network, address| {
        let permitted = address == allowed;
        async move {
            if permitted {
                dial_tcp(network, address).await
            } else {
                Err::<TunnelConn, _>(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is not reachable from here", address),
                ))
            }
        }
    })
}

/// Echo server reachable only through `outer` then `inner`.
async fn chain(
    handler: fn(ServerConfig) -> TunnelHandler,
) -> (EchoServer, TestTunnelServer, TestTunnelServer) {
    let echo = EchoServer::start().await.expect("Should start echo server");
    let inner = TestTunnelServer::start(handler(
        ServerConfig::new().with_dial(restricted_dial(echo.addr())),
    ))
    .await
    .expect("Should start inner proxy");
    let outer = TestTunnelServer::start(handler(
        ServerConfig::new().with_dial(restricted_dial(inner.addr())),
    ))
    .await
    .expect("Should start outer proxy");
    (echo, inner, outer)
}

#[tokio::test]
async fn test_h2c_through_h1_chain() {
    let (echo, inner, outer) = chain(TunnelHandler::new).await;

    let outer_dialer: Arc<dyn Dialer> = Arc::new(
        H1Dialer::new(ClientConfig::new(outer.http_url())).expect("Should create outer dialer"),
    );
    let inner_dialer = H2Dialer::h2c(
        ClientConfig::new(inner.http_url()).with_dial_context(Dial::through(outer_dialer.clone())),
    )
    .expect("Should create inner dialer");

    let mut conn = inner_dialer
        .dial_context("tcp", &echo.addr().to_string())
        .await
        .expect("Should open chained tunnel");
    assert_echo(&mut conn, b"two hops").await;

    // The outer proxy alone cannot reach the target.
    let err = outer_dialer
        .dial_context("tcp", &echo.addr().to_string())
        .await
        .expect_err("Target should not be reachable through one hop");
    assert_eq!(err.proxy_error().map(|e| e.status_code), Some(502));
}

#[tokio::test]
async fn test_h1_through_h2c_chain() {
    let (echo, inner, outer) = chain(TunnelHandler::new).await;

    let outer_dialer = Arc::new(
        H2Dialer::h2c(ClientConfig::new(outer.http_url())).expect("Should create outer dialer"),
    );
    let inner_dialer = H1Dialer::new(
        ClientConfig::new(inner.http_url()).with_dial_context(Dial::through(outer_dialer)),
    )
    .expect("Should create inner dialer");

    let mut conn = inner_dialer
        .dial_context("tcp", &echo.addr().to_string())
        .await
        .expect("Should open chained tunnel");
    assert_echo(&mut conn, b"two hops, other way round").await;
    conn.close().await.expect("Should close");

    assert!(outer.wait_for_tunnels(0).await);
    assert!(inner.wait_for_tunnels(0).await);
}

#[tokio::test]
async fn test_chain_propagates_inner_rejection() {
    let (echo, inner, outer) = chain(TunnelHandler::h1).await;

    let outer_dialer = Arc::new(
        H1Dialer::new(ClientConfig::new(outer.http_url())).expect("Should create outer dialer"),
    );
    let inner_dialer = H1Dialer::new(
        ClientConfig::new(inner.http_url()).with_dial_context(Dial::through(outer_dialer)),
    )
    .expect("Should create inner dialer");

    // The inner proxy can only reach the echo server.
    let err = inner_dialer
        .dial_context("tcp", &outer.addr().to_string())
        .await
        .expect_err("Inner proxy should refuse other targets");
    assert_eq!(err.proxy_error().map(|e| e.status_code), Some(502));

    let mut conn = inner_dialer
        .dial_context("tcp", &echo.addr().to_string())
        .await
        .expect("Should open chained tunnel");
    assert_echo(&mut conn, b"still works").await;
}

#[tokio::test]
async fn test_h2_over_tls_through_h1_chain() {
    let certificate = TestCertificate::generate();
    let echo = EchoServer::start().await.expect("Should start echo server");
    let inner = TestTunnelServer::start_tls(
        TunnelHandler::h2(ServerConfig::new().with_dial(restricted_dial(echo.addr()))),
        &certificate,
    )
    .await
    .expect("Should start inner proxy");
    let outer = TestTunnelServer::start(TunnelHandler::h1(
        ServerConfig::new().with_dial(restricted_dial(inner.addr())),
    ))
    .await
    .expect("Should start outer proxy");

    let outer_dialer = Arc::new(
        H1Dialer::new(ClientConfig::new(outer.http_url())).expect("Should create outer dialer"),
    );
    let inner_dialer = H2Dialer::new(
        ClientConfig::new(inner.https_url())
            .with_tls_config(certificate.client_config())
            .with_server_name("localhost")
            .with_dial_context(Dial::through(outer_dialer)),
    )
    .expect("Should create inner dialer");

    let mut conn = inner_dialer
        .dial_context("tcp", &echo.addr().to_string())
        .await
        .expect("Should open tunnel over TLS through the outer proxy");
    assert_echo(&mut conn, b"tls inside a tunnel").await;
    assert!(outer.wait_for_tunnels(1).await, "TLS session should ride one outer tunnel");
    assert!(inner.wait_for_tunnels(1).await);

    conn.close().await.expect("Should close");
    assert!(inner.wait_for_tunnels(0).await);
}
