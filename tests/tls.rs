//! TLS transport tests with a throwaway in-memory certificate chain.

use std::sync::Once;
use std::time::Duration;

use anyhow::Result;
use framelink::{
    HandlerOptions, Message, SocketClient, SocketServer, TlsClientConfig, TlsServerConfig,
    TransportError,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
use tokio::time::{sleep, timeout};

const SEND_TIMEOUT: Duration = Duration::from_secs(1);

static CRYPTO_INIT: Once = Once::new();

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    CRYPTO_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("install ring crypto provider");
    });
}

struct TestPki {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

/// Self-signed CA plus a leaf certificate for "localhost" signed by it.
fn generate_test_pki() -> TestPki {
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "framelink test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().expect("generate CA key");
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

    let mut leaf_params = CertificateParams::default();
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    leaf_params.subject_alt_names = vec![SanType::DnsName(
        "localhost".try_into().expect("valid dns name"),
    )];
    let leaf_key = KeyPair::generate().expect("generate leaf key");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("sign leaf");

    TestPki {
        ca_pem: ca_cert.pem().into_bytes(),
        cert_pem: leaf_cert.pem().into_bytes(),
        key_pem: leaf_key.serialize_pem().into_bytes(),
    }
}

#[tokio::test]
async fn tls_ping_pong_end_to_end() -> Result<()> {
    init();
    let pki = generate_test_pki();

    let server_tls = TlsServerConfig::new(&pki.cert_pem, &pki.key_pem)?;
    let server = SocketServer::listen(0, Some(server_tls), HandlerOptions::queued()).await?;
    let port = server.local_addr().port();

    let client_tls = TlsClientConfig::new(&pki.ca_pem, "localhost")?;
    let client =
        SocketClient::connect("127.0.0.1", port, Some(client_tls), HandlerOptions::direct())
            .await?;
    client
        .send(&Message::new(client.client_uid(), b"ping".to_vec()), SEND_TIMEOUT)
        .await?;

    let (uid, handler) = timeout(Duration::from_secs(5), server.accept()).await??;
    let ping = timeout(Duration::from_secs(5), handler.receive()).await??;
    assert_eq!(ping.body(), b"ping");

    server
        .send_to(uid, &Message::new(uid, b"pong".to_vec()), SEND_TIMEOUT)
        .await?;
    let pong = timeout(Duration::from_secs(5), client.receive()).await??;
    assert_eq!(pong.body(), b"pong");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_handshake_produces_no_handler() -> Result<()> {
    init();
    let server_pki = generate_test_pki();
    // A CA the server's certificate does not chain to.
    let other_pki = generate_test_pki();

    let server_tls = TlsServerConfig::new(&server_pki.cert_pem, &server_pki.key_pem)?;
    let server = SocketServer::listen(0, Some(server_tls), HandlerOptions::queued()).await?;
    let port = server.local_addr().port();

    let client_tls = TlsClientConfig::new(&other_pki.ca_pem, "localhost")?;
    let result =
        SocketClient::connect("127.0.0.1", port, Some(client_tls), HandlerOptions::direct())
            .await;
    assert!(matches!(result, Err(TransportError::Handshake(_))));

    // The server side dropped the connection too; nothing was registered.
    sleep(Duration::from_millis(200)).await;
    assert!(server.clients().await.is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn garbage_pem_is_rejected_up_front() {
    init();
    assert!(matches!(
        TlsClientConfig::new(b"not a certificate", "localhost"),
        Err(TransportError::Certificate(_))
    ));
    assert!(matches!(
        TlsServerConfig::new(b"not a certificate", b"not a key"),
        Err(TransportError::Certificate(_))
    ));
}
