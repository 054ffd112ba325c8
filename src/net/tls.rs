//! TLS configuration and certificate loading.
//!
//! Builds a rustls server config on the ring provider with TLS 1.2 and 1.3,
//! an optional cipher-suite allow-list, and ALPN offering `h2` ahead of
//! `http/1.1`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::config::TlsConfig;

pub use tokio_rustls::TlsAcceptor;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unknown cipher suite {0}")]
    UnknownCipherSuite(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Load the certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    if !path.exists() {
        return Err(TlsError::NotFound(path.to_path_buf()));
    }
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Build the rustls server config. `h2` controls whether `h2` is offered
/// during ALPN.
pub fn build_server_config(tls: &TlsConfig, h2: bool) -> Result<rustls::ServerConfig, TlsError> {
    let certs = load_certs(Path::new(&tls.cert_path))?;
    let key = load_private_key(Path::new(&tls.key_path))?;

    let mut provider = rustls::crypto::ring::default_provider();
    if !tls.cipher_suites.is_empty() {
        for name in &tls.cipher_suites {
            let known = provider
                .cipher_suites
                .iter()
                .any(|suite| format!("{:?}", suite.suite()) == *name);
            if !known {
                return Err(TlsError::UnknownCipherSuite(name.clone()));
            }
        }
        provider
            .cipher_suites
            .retain(|suite| tls.cipher_suites.contains(&format!("{:?}", suite.suite())));
    }

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = if h2 {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        vec![ALPN_HTTP11.to_vec()]
    };

    tracing::info!(
        cert = %tls.cert_path,
        h2,
        cipher_suites = tls.cipher_suites.len(),
        "TLS configured"
    );
    Ok(config)
}

pub fn build_tls_acceptor(tls: &TlsConfig, h2: bool) -> Result<TlsAcceptor, TlsError> {
    Ok(TlsAcceptor::from(Arc::new(build_server_config(tls, h2)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_pair() -> (NamedTempFile, NamedTempFile) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert = NamedTempFile::new().unwrap();
        cert.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key = NamedTempFile::new().unwrap();
        key.write_all(certified.key_pair.serialize_pem().as_bytes()).unwrap();
        (cert, key)
    }

    fn tls_config(cert: &NamedTempFile, key: &NamedTempFile, suites: &[&str]) -> TlsConfig {
        TlsConfig {
            cert_path: cert.path().to_string_lossy().into_owned(),
            key_path: key.path().to_string_lossy().into_owned(),
            cipher_suites: suites.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn alpn_prefers_h2() {
        let (cert, key) = write_pair();
        let config = build_server_config(&tls_config(&cert, &key, &[]), true).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let config = build_server_config(&tls_config(&cert, &key, &[]), false).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn missing_files_are_reported() {
        let tls = TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
            cipher_suites: Vec::new(),
        };
        assert!(matches!(build_server_config(&tls, true), Err(TlsError::NotFound(_))));
    }

    #[test]
    fn cipher_suite_allow_list() {
        let (cert, key) = write_pair();
        let tls = tls_config(&cert, &key, &["TLS13_AES_256_GCM_SHA384"]);
        assert!(build_server_config(&tls, true).is_ok());

        let tls = tls_config(&cert, &key, &["TLS_NOT_A_SUITE"]);
        assert!(matches!(
            build_server_config(&tls, true),
            Err(TlsError::UnknownCipherSuite(_))
        ));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let (_, key) = write_pair();
        let empty = NamedTempFile::new().unwrap();
        assert!(matches!(
            load_certs(empty.path()),
            Err(TlsError::NoCertificates(_))
        ));
        assert!(load_private_key(key.path()).is_ok());
    }
}
