//! PKI error types.

use std::path::PathBuf;

/// Errors from loading, parsing or verifying certificates.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("No private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Verifier setup failed: {0}")]
    Verifier(String),

    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
