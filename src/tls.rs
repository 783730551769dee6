//! # TLS Negotiation
//!
//! Optional TLS beneath the framing layer. A handshake is a blocking,
//! one-time setup step performed before a handler exists; if it fails the
//! connection attempt is aborted and no handler is ever produced.
//!
//! Certificates and keys are supplied as PEM bytes by bootstrap code - this
//! module never reads files or environment state itself.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::TransportError;

/// Deadline for completing a TLS handshake, client or server side.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side TLS configuration: the roots to trust and the name to verify
/// on the server certificate.
#[derive(Clone)]
pub struct TlsClientConfig {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsClientConfig {
    /// Build a client configuration trusting the CA certificates in
    /// `ca_cert_pem` and expecting the server to present a certificate for
    /// `server_name`.
    pub fn new(ca_cert_pem: &[u8], server_name: &str) -> Result<Self, TransportError> {
        let ca_certs = parse_certificates(ca_cert_pem)?;
        if ca_certs.is_empty() {
            return Err(TransportError::Certificate(
                "no CA certificates found".into(),
            ));
        }

        let mut root_store = RootCertStore::empty();
        for cert in ca_certs {
            root_store.add(cert).map_err(|e| {
                TransportError::Certificate(format!("failed to add CA certificate: {}", e))
            })?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| TransportError::TlsConfig(format!("invalid server name: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Connector for the outbound handshake.
    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    /// Name verified against the server certificate.
    pub(crate) fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

/// Server-side TLS configuration: the certificate chain and private key
/// presented to connecting clients.
#[derive(Clone)]
pub struct TlsServerConfig {
    config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    /// Build a server configuration from a PEM certificate chain and key.
    pub fn new(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let certs = parse_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err(TransportError::Certificate("no certificates found".into()));
        }
        let key = parse_private_key(key_pem)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsConfig(format!("server config error: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Acceptor for inbound handshakes.
    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("failed to parse certificates: {}", e)))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TransportError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| TransportError::PrivateKey(format!("failed to parse private key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_ca() {
        let result = TlsClientConfig::new(b"not a pem", "localhost");
        assert!(matches!(result, Err(TransportError::Certificate(_))));
    }

    #[test]
    fn rejects_garbage_server_cert() {
        let result = TlsServerConfig::new(b"not a pem", b"also not a pem");
        assert!(matches!(result, Err(TransportError::Certificate(_))));
    }
}
