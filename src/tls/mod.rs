//! TLS acceptor construction for the tunnel side
//!
//! The TLS mode code from the configuration URL selects how data channels
//! are secured: `"0"` plaintext, `"1"` an in-memory self-signed
//! certificate, `"2"` a certificate and key loaded from PEM files. The
//! code itself is echoed verbatim to the client at handshake so it can
//! pick the matching cipher mode.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// TLS errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS material: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("No certificates found in {0}")]
    NoCertificate(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS mode {0} requires crt and key paths")]
    MissingPaths(String),

    #[error("Unknown TLS mode: {0}")]
    UnknownMode(String),
}

/// Build the data channel acceptor for a TLS mode code. Mode `"0"` yields
/// `None` (plaintext data channels).
pub fn acceptor_for_mode(
    code: &str,
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<Option<TlsAcceptor>, TlsError> {
    match code {
        "0" => Ok(None),
        "1" => {
            let acceptor = self_signed_acceptor()?;
            info!("TLS mode 1: in-memory self-signed certificate");
            Ok(Some(acceptor))
        }
        "2" => match (cert_path, key_path) {
            (Some(cert), Some(key)) => {
                let acceptor = acceptor_from_files(cert, key)?;
                info!("TLS mode 2: certificate loaded from {}", cert.display());
                Ok(Some(acceptor))
            }
            _ => Err(TlsError::MissingPaths(code.to_string())),
        },
        other => Err(TlsError::UnknownMode(other.to_string())),
    }
}

/// Acceptor backed by a freshly generated self-signed certificate.
pub fn self_signed_acceptor() -> Result<TlsAcceptor, TlsError> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| TlsError::Generation(e.to_string()))?;

    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Acceptor backed by a PEM certificate chain and private key on disk.
pub fn acceptor_from_files(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load a TLS certificate chain from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.display().to_string()));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_zero_is_plaintext() {
        assert!(acceptor_for_mode("0", None, None).unwrap().is_none());
    }

    #[test]
    fn test_self_signed_mode_builds() {
        assert!(acceptor_for_mode("1", None, None).unwrap().is_some());
    }

    #[test]
    fn test_file_mode_requires_paths() {
        let err = match acceptor_for_mode("2", None, None) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, TlsError::MissingPaths(_)));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = match acceptor_for_mode("9", None, None) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, TlsError::UnknownMode(_)));
    }
}
