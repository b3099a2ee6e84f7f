//! PEM file loading.

use super::TlsError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::path::Path;
use tracing::debug;

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Read every certificate from a PEM file.
///
/// Fails if the file is unreadable, malformed, or holds no certificate.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }

    Ok(certs)
}

/// Read the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| TlsError::Parse {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Build an immutable root store from a CA bundle.
///
/// Every certificate in the bundle must be accepted as a trust anchor.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|source| TlsError::InvalidCertificate {
                path: path.to_path_buf(),
                source,
            })?;
    }

    debug!(path = %path.display(), roots = roots.len(), "loaded CA bundle");
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_root_store() {
        let first = rcgen::generate_simple_self_signed(vec!["ca-one".to_string()]).unwrap();
        let second = rcgen::generate_simple_self_signed(vec!["ca-two".to_string()]).unwrap();
        let bundle = pem_file(&format!("{}{}", first.cert.pem(), second.cert.pem()));

        let roots = load_root_store(bundle.path()).unwrap();
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_missing_bundle() {
        let result = load_root_store(Path::new("/nonexistent/ca.crt"));
        assert!(matches!(result.unwrap_err(), TlsError::Read { .. }));
    }

    #[test]
    fn test_bundle_without_certificates() {
        let bundle = pem_file("this is not a certificate\n");
        let result = load_root_store(bundle.path());
        assert!(matches!(result.unwrap_err(), TlsError::NoCertificates(_)));
    }

    #[test]
    fn test_corrupt_certificate() {
        let bundle = pem_file("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n");
        let result = load_root_store(bundle.path());
        assert!(matches!(
            result.unwrap_err(),
            TlsError::InvalidCertificate { .. } | TlsError::Parse { .. }
        ));
    }

    #[test]
    fn test_load_private_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["proxyd".to_string()]).unwrap();
        let key = pem_file(&cert.key_pair.serialize_pem());
        assert!(load_private_key(key.path()).is_ok());

        let not_a_key = pem_file(&cert.cert.pem());
        let result = load_private_key(not_a_key.path());
        assert!(matches!(result.unwrap_err(), TlsError::NoPrivateKey(_)));
    }
}
