//! Mutual TLS for the server connection.
//!
//! The client verifies the server against a private CA (no system roots) and
//! presents its own certificate. Hostname verification uses the configured
//! endpoint host, so `IP_ADDRESS` must match a name in the server
//! certificate.

use std::io;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::{Error, Result};

/// Client side of a mutual TLS session.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient").finish_non_exhaustive()
    }
}

impl TlsClient {
    /// Load the client certificate chain, its key, and the CA from PEM files.
    pub fn from_files(client_cert: &Path, client_key: &Path, ca_cert: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| Error::Tls(format!("cannot read {}: {}", path.display(), e)))
        };
        Self::from_pem(&read(client_cert)?, &read(client_key)?, &read(ca_cert)?)
    }

    /// Build from PEM-encoded material.
    pub fn from_pem(client_cert: &[u8], client_key: &[u8], ca_cert: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_cert, "CA")? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("invalid CA certificate: {}", e)))?;
        }

        let chain = parse_certs(client_cert, "client")?;
        let key = PrivateKeyDer::from_pem_slice(client_key)
            .map_err(|e| Error::Tls(format!("invalid client key: {}", e)))?;

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::Tls(format!("client certificate rejected: {}", e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Run the TLS handshake over an established TCP stream.
    pub async fn handshake(&self, host: &str, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.connector.connect(name, tcp).await
    }
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid {} certificate PEM: {}", what, e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no {} certificates found", what)));
    }
    Ok(certs)
}
