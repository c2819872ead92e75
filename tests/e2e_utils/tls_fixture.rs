#![cfg(test)]
#![allow(dead_code)]

use std::sync::Arc;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;

use connect_tunnel::adapters::tls;

/// Self-signed certificate for "localhost" and 127.0.0.1.
pub struct TestCertificate {
    cert: CertificateDer<'static>,
    key: Vec<u8>,
}

impl TestCertificate {
    pub fn generate() -> Self {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .expect("Should generate certificate");
        Self {
            cert: cert.der().clone(),
            key: key_pair.serialize_der(),
        }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone()));
        tls::acceptor(vec![self.cert.clone()], key).expect("Should build TLS acceptor")
    }

    /// Client settings trusting only this certificate.
    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots
            .add(self.cert.clone())
            .expect("Should add test certificate");
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}
