//! TLS for the coordinator's listener.
//!
//! The coordinator serves a single certificate chain and key, mounted as PEM
//! files. Engines and the controller connect as ordinary TLS clients.

use loadfleet_core::{LoadfleetError, LoadfleetResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// `[coordinator.tls]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Serve HTTPS instead of HTTP.
    pub enabled: bool,
    /// PEM certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub key_path: PathBuf,
}

impl TlsConfig {
    /// When enabled, both files must be configured and present.
    pub fn validate(&self) -> LoadfleetResult<()> {
        if !self.enabled {
            return Ok(());
        }
        for (field, path) in [("cert_path", &self.cert_path), ("key_path", &self.key_path)] {
            if path.as_os_str().is_empty() {
                return Err(LoadfleetError::Config(format!("TLS enabled but {field} is empty")));
            }
            if !path.is_file() {
                return Err(LoadfleetError::Config(format!(
                    "TLS {field} not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// The listener's acceptor, or `None` when TLS is off.
    ///
    /// ALPN offers `http/1.1` only since the broker route upgrades to WebSocket.
    pub async fn acceptor(&self) -> LoadfleetResult<Option<TlsAcceptor>> {
        if !self.enabled {
            return Ok(None);
        }
        self.validate()?;
        let (cert_pem, key_pem) =
            tokio::try_join!(read_pem(&self.cert_path), read_pem(&self.key_path))?;
        let chain = parse_chain(&cert_pem, &self.cert_path)?;
        let key = parse_key(&key_pem, &self.key_path)?;

        let mut server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| LoadfleetError::Config(format!("Certificate and key rejected: {e}")))?;
        server.alpn_protocols = vec![b"http/1.1".to_vec()];

        info!(cert = %self.cert_path.display(), "TLS listener configured");
        Ok(Some(TlsAcceptor::from(Arc::new(server))))
    }
}

async fn read_pem(path: &Path) -> LoadfleetResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| LoadfleetError::Config(format!("Failed to read '{}': {e}", path.display())))
}

fn parse_chain(pem: &[u8], path: &Path) -> LoadfleetResult<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LoadfleetError::Config(format!("Bad certificate in '{}': {e}", path.display())))?;
    if chain.is_empty() {
        return Err(LoadfleetError::Config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }
    Ok(chain)
}

fn parse_key(pem: &[u8], path: &Path) -> LoadfleetResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| LoadfleetError::Config(format!("Bad private key in '{}': {e}", path.display())))?
        .ok_or_else(|| {
            LoadfleetError::Config(format!("No private key found in '{}'", path.display()))
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const CERT_ONLY: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

    fn enabled(cert: PathBuf, key: PathBuf) -> TlsConfig {
        TlsConfig {
            enabled: true,
            cert_path: cert,
            key_path: key,
        }
    }

    #[tokio::test]
    async fn test_disabled_has_no_acceptor() {
        let config = TlsConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.acceptor().await.unwrap().is_none());
    }

    #[test]
    fn test_missing_paths_rejected() {
        let err = enabled(PathBuf::new(), PathBuf::new()).validate().unwrap_err();
        assert!(err.to_string().contains("cert_path is empty"));

        let err = enabled("/nonexistent/tls.crt".into(), "/nonexistent/tls.key".into())
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("cert_path not found"));
    }

    #[tokio::test]
    async fn test_empty_cert_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        std::fs::write(&cert, "").unwrap();
        let err = enabled(cert.clone(), cert).acceptor().await.err().unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[tokio::test]
    async fn test_key_file_without_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        std::fs::write(&cert, CERT_ONLY).unwrap();
        let err = enabled(cert.clone(), cert).acceptor().await.err().unwrap();
        assert!(err.to_string().contains("No private key found"));
    }

    #[test]
    fn test_config_fields_default_individually() {
        let config: TlsConfig =
            serde_json::from_str(r#"{"enabled": true, "cert_path": "/tls/tls.crt"}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.cert_path, PathBuf::from("/tls/tls.crt"));
        assert!(config.key_path.as_os_str().is_empty());
    }
}
