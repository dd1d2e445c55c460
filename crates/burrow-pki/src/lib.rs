//! Burrow PKI Library
//!
//! Certificate plumbing shared by the agent and the broker:
//!
//! - **PEM**: load certificate chains and private keys from disk
//! - **Thumbprint**: SHA-256 over a certificate's DER encoding
//! - **Identity**: read the subject common name of a peer certificate
//! - **Verifier**: server-certificate verification pinned to one CA
//! - **Certs** (`certs` feature): generate a CA plus server and client
//!   certificates for development and tests

pub mod error;
pub mod identity;
pub mod pem;
pub mod thumbprint;
pub mod verifier;

#[cfg(any(test, feature = "certs"))]
pub mod certs;

pub use error::PkiError;
pub use identity::common_name;
pub use pem::{load_certs, load_private_key};
pub use thumbprint::Thumbprint;
pub use verifier::PinnedCaVerifier;

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install `ring` as the process-wide rustls crypto provider.
///
/// Safe to call any number of times. Both the tunnel TLS stack and
/// `reqwest` (built with `rustls-no-provider`) rely on it.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
