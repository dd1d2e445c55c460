//! Tunnel client error types.

/// Errors that end one connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum TunnelClientError {
    /// Client certificate, key or pinned CA could not be loaded.
    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TunnelClientError {
    /// Retrying cannot fix these.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Certificate(_) | Self::Config(_))
    }
}

impl From<burrow_pki::PkiError> for TunnelClientError {
    fn from(e: burrow_pki::PkiError) -> Self {
        Self::Certificate(e.to_string())
    }
}
