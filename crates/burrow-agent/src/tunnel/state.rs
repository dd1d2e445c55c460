//! Connection lifecycle states, published through a `watch` channel.

use std::fmt;

/// Where the current connection attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No attempt in progress; waiting out the backoff delay or not started.
    Disconnected,
    /// Loading certificates and completing the mTLS handshake.
    Authenticating,
    /// Waiting for the broker to answer a ping.
    HealthChecking,
    /// Envelope stream open.
    Streaming,
    /// The manager has stopped and will not reconnect.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::HealthChecking => "health_checking",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
