//! TLS configuration for the tunnel listener.
//!
//! The listener always requires a client certificate: the agent's identity is
//! the CN of that certificate.

use std::path::{Path, PathBuf};

use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::info;

use burrow_pki::certs::{DevTlsPaths, ensure_dev_bundle};

/// Where the broker's TLS material comes from.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Generated CA, server and agent certificates for local development.
    DevSelfSigned {
        cert_dir: PathBuf,
        /// CN written into the generated agent certificate.
        agent_id: String,
    },
    /// Operator-provided PEM files.
    Custom {
        cert_path: PathBuf,
        key_path: PathBuf,
        client_ca_path: PathBuf,
    },
}

impl TlsMode {
    /// Default directory for development certificates.
    pub fn default_dev_dir() -> Result<PathBuf, TlsConfigError> {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|d| d.join("burrow").join("dev-certs"))
            .ok_or_else(|| TlsConfigError::FileRead("Cannot determine data directory".into()))
    }

    /// Build the tonic server TLS config, requiring client certificates.
    pub fn to_server_tls_config(&self) -> Result<ServerTlsConfig, TlsConfigError> {
        match self {
            Self::DevSelfSigned { cert_dir, agent_id } => {
                let paths = ensure_dev_bundle(cert_dir, agent_id, &["localhost", "127.0.0.1"])
                    .map_err(|e| TlsConfigError::CertGeneration(e.to_string()))?;
                info!(
                    cert_dir = %cert_dir.display(),
                    agent_cert = %paths.agent_cert.display(),
                    "Dev TLS enabled"
                );
                build(&paths.server_cert, &paths.server_key, &paths.ca_cert)
            }
            Self::Custom {
                cert_path,
                key_path,
                client_ca_path,
            } => {
                let config = build(cert_path, key_path, client_ca_path)?;
                info!(
                    cert = %cert_path.display(),
                    client_ca = %client_ca_path.display(),
                    "Custom TLS enabled"
                );
                Ok(config)
            }
        }
    }

    /// Paths of the generated material, for dev mode.
    pub fn dev_paths(&self) -> Option<DevTlsPaths> {
        match self {
            Self::DevSelfSigned { cert_dir, .. } => Some(DevTlsPaths::in_dir(cert_dir)),
            Self::Custom { .. } => None,
        }
    }
}

fn build(cert: &Path, key: &Path, client_ca: &Path) -> Result<ServerTlsConfig, TlsConfigError> {
    // Parse up front so a bad file fails startup with its path in the error.
    burrow_pki::load_certs(cert).map_err(|e| TlsConfigError::FileRead(e.to_string()))?;
    burrow_pki::load_private_key(key).map_err(|e| TlsConfigError::FileRead(e.to_string()))?;
    burrow_pki::load_certs(client_ca).map_err(|e| TlsConfigError::FileRead(e.to_string()))?;

    let identity = Identity::from_pem(read(cert)?, read(key)?);
    Ok(ServerTlsConfig::new()
        .identity(identity)
        .client_ca_root(Certificate::from_pem(read(client_ca)?)))
}

fn read(path: &Path) -> Result<String, TlsConfigError> {
    std::fs::read_to_string(path)
        .map_err(|e| TlsConfigError::FileRead(format!("Failed to read {}: {e}", path.display())))
}

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("File read error: {0}")]
    FileRead(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dev_self_signed_writes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mode = TlsMode::DevSelfSigned {
            cert_dir: dir.path().to_path_buf(),
            agent_id: "dev-agent".into(),
        };
        mode.to_server_tls_config().unwrap();

        let paths = mode.dev_paths().unwrap();
        assert!(paths.ca_cert.exists());
        assert!(paths.server_key.exists());
        let agent = burrow_pki::load_certs(&paths.agent_cert).unwrap();
        assert_eq!(
            burrow_pki::common_name(&agent[0]).as_deref(),
            Some("dev-agent")
        );
    }

    #[test]
    fn custom_missing_files_fail() {
        let mode = TlsMode::Custom {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
            client_ca_path: PathBuf::from("/nonexistent/ca.pem"),
        };
        let err = mode.to_server_tls_config().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }
}
