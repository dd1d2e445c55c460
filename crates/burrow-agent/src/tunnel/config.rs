//! Tunnel client configuration.

use std::path::PathBuf;
use std::time::Duration;

use burrow_core::AgentSettings;
use burrow_core::config::ReconnectSettings;

/// Configuration for the agent's tunnel connection to the broker.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Broker URL (e.g., "https://broker.example.com:50051").
    pub broker_url: String,

    /// Name checked against the broker certificate. Defaults to the URL host.
    pub tls_server_name: Option<String>,

    /// Configured agent id. The broker identifies the agent by its
    /// certificate CN; this is used for logging only.
    pub agent_id: Option<String>,

    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,

    /// CA that must be the root of the broker's certificate chain.
    pub ca_cert_path: PathBuf,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Deadline for the ping that precedes opening the stream.
    pub ping_timeout: Duration,

    /// Ceiling on concurrently forwarded requests (None = unbounded).
    pub max_concurrent_requests: Option<usize>,
}

impl TunnelConfig {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            broker_url: settings.broker_url.clone(),
            tls_server_name: settings.tls_server_name.clone(),
            agent_id: settings.agent_id.clone(),
            client_cert_path: settings.client_cert_path.clone(),
            client_key_path: settings.client_key_path.clone(),
            ca_cert_path: settings.ca_cert_path.clone(),
            reconnect: ReconnectPolicy::from(&settings.reconnect),
            heartbeat_interval: settings.heartbeat_interval(),
            ping_timeout: settings.ping_timeout(),
            max_concurrent_requests: settings.max_concurrent_requests,
        }
    }
}

/// Exponential backoff reconnection policy. Retries never stop on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(s: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            multiplier: s.multiplier,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a given attempt number (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
