//! TLS security layer
//!
//! Wraps an established connection in a rustls client or server session.
//! Deadlines and endpoint addresses carry over to the secured connection.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::{BoxedConnection, Connection, RawConnection};
use crate::common::Destination;
use crate::error::{Error, Result};

/// TLS settings of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    /// SNI; defaults to the destination host when dialing
    pub server_name: Option<String>,
    /// Skip certificate verification
    pub allow_insecure: bool,
    pub alpn: Vec<String>,
    /// Certificate chain (PEM), server side
    pub certificate_file: Option<String>,
    /// Private key (PEM), server side
    pub key_file: Option<String>,
}

impl TlsSettings {
    pub fn connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !self.alpn.is_empty() {
            config.alpn_protocols = self.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();
        }

        if self.allow_insecure {
            config.dangerous().set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        TlsConnector::from(Arc::new(config))
    }

    /// Build the server side; fails without a certificate and key
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let (Some(cert_file), Some(key_file)) = (&self.certificate_file, &self.key_file) else {
            return Err(Error::Config("TLS server requires certificateFile and keyFile".into()));
        };

        let certs = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("Invalid TLS certificate: {}", e)))?;
        if !self.alpn.is_empty() {
            config.alpn_protocols = self.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();
        }

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Secure an outbound connection to `dest`
    pub async fn client(&self, conn: BoxedConnection, dest: &Destination) -> Result<BoxedConnection> {
        let server_name = self.server_name.clone().unwrap_or_else(|| dest.address.host());
        let domain = ServerName::try_from(server_name.clone())
            .map_err(|_| Error::Config(format!("Invalid server name: {}", server_name)))?;

        let (local, remote) = (conn.local_addr(), conn.remote_addr());
        let stream = self.connector().connect(domain, conn).await?;
        debug!("TLS client handshake with {} completed", server_name);
        Ok(Box::new(RawConnection::new(stream).with_addrs(local, remote)))
    }
}

/// Secure an inbound connection with a prepared acceptor
pub async fn accept(acceptor: &TlsAcceptor, conn: BoxedConnection) -> Result<BoxedConnection> {
    let (local, remote) = (conn.local_addr(), conn.remote_addr());
    let stream = acceptor.accept(conn).await?;
    Ok(Box::new(RawConnection::new(stream).with_addrs(local, remote)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| Error::Config(format!("Failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certificates: {}", e)))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| Error::Config(format!("Failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| Error::Config(format!("Failed to parse private key: {}", e)))?;
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(Error::Config("No valid private key found in file".into()))
}

/// Accepts any server certificate (`allowInsecure`)
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_json() {
        let settings: TlsSettings = serde_json::from_value(serde_json::json!({
            "serverName": "example.com",
            "allowInsecure": true,
            "alpn": ["h2", "http/1.1"]
        }))
        .unwrap();
        assert_eq!(settings.server_name.as_deref(), Some("example.com"));
        assert!(settings.allow_insecure);
        assert_eq!(settings.alpn.len(), 2);
    }

    #[test]
    fn test_acceptor_requires_certificate() {
        let Err(err) = TlsSettings::default().acceptor() else {
            panic!("acceptor built without a certificate");
        };
        assert!(matches!(err, Error::Config(_)));

        let missing = TlsSettings {
            certificate_file: Some("/nonexistent/cert.pem".into()),
            key_file: Some("/nonexistent/key.pem".into()),
            ..Default::default()
        };
        assert!(missing.acceptor().is_err());
    }
}
