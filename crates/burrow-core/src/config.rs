//! Configuration files for the agent and the broker.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. JSON file passed with `--config`
//! 3. Environment variables
//! 4. CLI arguments
//!
//! This module owns layers 1 and 2. The binaries layer env and CLI on top
//! with `clap` (`#[arg(env = ...)]`), so every field here has a flag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest HTTP body carried through the tunnel in either direction.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound for `max_body_bytes` and `max_response_bytes`.
///
/// A body plus its headers must fit in one gRPC envelope; anything larger
/// fails the encoder and takes the shared tunnel stream down with it.
pub const MAX_BODY_BYTES_LIMIT: usize = 16 * 1024 * 1024;

/// Settings read by `burrow-agent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Logical agent id. Falls back to the client certificate CN.
    pub agent_id: Option<String>,
    /// Broker gRPC endpoint, e.g. `https://broker.example.com:50051`.
    pub broker_url: String,
    /// Name checked against the broker certificate when it differs from the
    /// host in `broker_url`.
    pub tls_server_name: Option<String>,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    /// CA that must sit at the root of the broker's chain.
    pub ca_cert_path: PathBuf,
    pub heartbeat_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub reconnect: ReconnectSettings,
    /// Local service that receives forwarded requests.
    pub upstream_url: String,
    pub upstream_timeout_secs: u64,
    pub max_response_bytes: usize,
    /// Ceiling on concurrently forwarded requests. `None` means unbounded.
    pub max_concurrent_requests: Option<usize>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_id: None,
            broker_url: "https://localhost:50051".to_string(),
            tls_server_name: None,
            client_cert_path: PathBuf::from("certs/agent.pem"),
            client_key_path: PathBuf::from("certs/agent-key.pem"),
            ca_cert_path: PathBuf::from("certs/ca.pem"),
            heartbeat_interval_secs: 30,
            ping_timeout_secs: 5,
            reconnect: ReconnectSettings::default(),
            upstream_url: "http://localhost:80".to_string(),
            upstream_timeout_secs: 30,
            max_response_bytes: DEFAULT_MAX_BODY_BYTES,
            max_concurrent_requests: None,
        }
    }
}

impl AgentSettings {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Reject values that would make the agent spin or never send.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(Error::Config("heartbeat_interval_secs must be > 0".into()));
        }
        if self.ping_timeout_secs == 0 || self.upstream_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be > 0".into()));
        }
        if self.max_concurrent_requests == Some(0) {
            return Err(Error::Config(
                "max_concurrent_requests must be > 0 when set".into(),
            ));
        }
        validate_body_limit("max_response_bytes", self.max_response_bytes)?;
        self.reconnect.validate()
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectSettings {
    fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 || self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::Config(format!(
                "invalid reconnect delays: initial {}ms, max {}ms",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(Error::Config(format!(
                "reconnect multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Settings read by `burrow-broker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Address for the gRPC tunnel listener (mTLS).
    pub grpc_addr: String,
    /// Address for the public HTTP gateway. Usually behind a reverse proxy.
    pub http_addr: String,
    pub server_cert_path: Option<PathBuf>,
    pub server_key_path: Option<PathBuf>,
    /// CA that signs agent client certificates.
    pub client_ca_path: Option<PathBuf>,
    /// Generate a throwaway CA, server and agent certificate on startup.
    pub dev_tls: bool,
    /// Where `dev_tls` writes its material. Defaults to the data dir.
    pub dev_tls_dir: Option<PathBuf>,
    pub routes_file: PathBuf,
    /// Shared secret for `/admin/*`. Admin endpoints refuse everything when
    /// unset.
    pub admin_token: Option<String>,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            grpc_addr: "0.0.0.0:50051".to_string(),
            http_addr: "127.0.0.1:5000".to_string(),
            server_cert_path: None,
            server_key_path: None,
            client_ca_path: None,
            dev_tls: false,
            dev_tls_dir: None,
            routes_file: PathBuf::from("routes.json"),
            admin_token: None,
            request_timeout_secs: 30,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl BrokerSettings {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be > 0".into()));
        }
        validate_body_limit("max_body_bytes", self.max_body_bytes)?;
        if !self.dev_tls
            && (self.server_cert_path.is_none()
                || self.server_key_path.is_none()
                || self.client_ca_path.is_none())
        {
            return Err(Error::Config(
                "server_cert_path, server_key_path and client_ca_path are required unless dev_tls is set"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn validate_body_limit(name: &str, value: usize) -> Result<()> {
    if value == 0 || value > MAX_BODY_BYTES_LIMIT {
        return Err(Error::Config(format!(
            "{name} must be between 1 and {MAX_BODY_BYTES_LIMIT}, got {value}"
        )));
    }
    Ok(())
}

/// Load agent settings: defaults, overlaid by `path` when given.
pub fn load_agent_settings(path: Option<&Path>) -> Result<AgentSettings> {
    path.map_or_else(|| Ok(AgentSettings::default()), load_settings_file)
}

/// Load broker settings: defaults, overlaid by `path` when given.
pub fn load_broker_settings(path: Option<&Path>) -> Result<BrokerSettings> {
    path.map_or_else(|| Ok(BrokerSettings::default()), load_settings_file)
}

// Missing keys keep their defaults through `#[serde(default)]`. A path that
// was asked for explicitly but cannot be read is an error.
fn load_settings_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}
