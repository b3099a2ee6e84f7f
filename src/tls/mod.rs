//! Cluster CA loading and TLS termination.
//!
//! The CA bundle is always loaded at startup, so a missing or corrupt bundle
//! fails fast even when connections are relayed without terminating TLS.

mod pem;

pub use pem::{load_certs, load_private_key, load_root_store};

use crate::config::{TlsConfig, TlsMode};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::info;

/// Errors that can occur while loading TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse PEM in {}: {source}", .path.display())]
    Parse { path: PathBuf, source: io::Error },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate in {}: {source}", .path.display())]
    InvalidCertificate { path: PathBuf, source: rustls::Error },

    #[error("tls.{0} is required when terminating TLS")]
    MissingSetting(&'static str),

    #[error("failed to build client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// ALPN protocols offered to clients when terminating TLS.
const SERVER_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Immutable TLS material shared by every connection.
#[derive(Clone)]
pub struct TlsSettings {
    roots: Arc<RootCertStore>,
    termination: Option<TlsTermination>,
}

impl TlsSettings {
    /// Load the CA bundle and, in terminate mode, the serving certificate.
    pub fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let roots = Arc::new(load_root_store(&config.ca_bundle)?);

        let termination = match config.mode {
            TlsMode::Passthrough => None,
            TlsMode::Terminate => Some(TlsTermination::new(config, Arc::clone(&roots))?),
        };

        info!(
            ca_bundle = %config.ca_bundle.display(),
            roots = roots.len(),
            mode = ?config.mode,
            "TLS settings loaded"
        );

        Ok(Self { roots, termination })
    }

    /// Trust anchors from the CA bundle.
    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }

    /// Present when the proxy terminates client TLS.
    pub fn termination(&self) -> Option<&TlsTermination> {
        self.termination.as_ref()
    }
}

/// Acceptor for clients and connector for upstreams, both anchored on the cluster CA.
#[derive(Clone)]
pub struct TlsTermination {
    acceptor: TlsAcceptor,
    upstream: Arc<ClientConfig>,
}

impl TlsTermination {
    fn new(config: &TlsConfig, roots: Arc<RootCertStore>) -> Result<Self, TlsError> {
        let cert_path = config.cert.as_ref().ok_or(TlsError::MissingSetting("cert"))?;
        let key_path = config.key.as_ref().ok_or(TlsError::MissingSetting("key"))?;

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());

        // Client certificates are checked when offered but not required.
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&provider))
                .allow_unauthenticated()
                .build()?;

        let mut server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;
        server.alpn_protocols = SERVER_ALPN.iter().map(|p| p.to_vec()).collect();

        let upstream = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            upstream: Arc::new(upstream),
        })
    }

    /// Complete the server-side handshake with a client.
    pub async fn accept(&self, stream: TcpStream) -> io::Result<server::TlsStream<TcpStream>> {
        self.acceptor.accept(stream).await
    }

    /// Complete the client-side handshake with an upstream API server.
    ///
    /// The upstream certificate is verified against the cluster CA for
    /// `address`. `alpn` carries the protocol negotiated with the client so
    /// both legs speak the same one.
    pub async fn connect(
        &self,
        stream: TcpStream,
        address: &str,
        alpn: Option<Vec<u8>>,
    ) -> io::Result<client::TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(address.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let connector = match alpn {
            Some(protocol) => {
                let mut config = ClientConfig::clone(&self.upstream);
                config.alpn_protocols = vec![protocol];
                TlsConnector::from(Arc::new(config))
            }
            None => TlsConnector::from(Arc::clone(&self.upstream)),
        };

        connector.connect(server_name, stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    /// A self-signed certificate for 127.0.0.1 that doubles as the CA.
    struct Material {
        ca: NamedTempFile,
        cert: NamedTempFile,
        key: NamedTempFile,
    }

    fn material() -> Material {
        let generated = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
        Material {
            ca: write_temp(&generated.cert.pem()),
            cert: write_temp(&generated.cert.pem()),
            key: write_temp(&generated.key_pair.serialize_pem()),
        }
    }

    #[test]
    fn test_passthrough_loads_roots_only() {
        let material = material();
        let config = TlsConfig {
            mode: TlsMode::Passthrough,
            ca_bundle: material.ca.path().to_path_buf(),
            cert: None,
            key: None,
        };

        let settings = TlsSettings::load(&config).unwrap();
        assert_eq!(settings.roots().len(), 1);
        assert!(settings.termination().is_none());
    }

    #[test]
    fn test_missing_bundle_is_fatal() {
        let config = TlsConfig {
            ca_bundle: PathBuf::from("/nonexistent/ca.crt"),
            ..TlsConfig::default()
        };
        assert!(TlsSettings::load(&config).is_err());
    }

    #[test]
    fn test_terminate_requires_key() {
        let material = material();
        let config = TlsConfig {
            mode: TlsMode::Terminate,
            ca_bundle: material.ca.path().to_path_buf(),
            cert: Some(material.cert.path().to_path_buf()),
            key: None,
        };
        assert!(matches!(
            TlsSettings::load(&config),
            Err(TlsError::MissingSetting("key"))
        ));
    }

    #[tokio::test]
    async fn test_terminate_round_trip() {
        let material = material();
        let config = TlsConfig {
            mode: TlsMode::Terminate,
            ca_bundle: material.ca.path().to_path_buf(),
            cert: Some(material.cert.path().to_path_buf()),
            key: Some(material.key.path().to_path_buf()),
        };
        let settings = TlsSettings::load(&config).unwrap();
        let termination = settings.termination().unwrap().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_side = termination.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = server_side.accept(stream).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.shutdown().await.unwrap();
        });

        // The upstream connector trusts the same CA, so it can talk to our own acceptor.
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut tls = termination
            .connect(stream, "127.0.0.1", Some(b"http/1.1".to_vec()))
            .await
            .unwrap();
        assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }
}
