//! Burrow Agent
//!
//! Dials the broker over mTLS and forwards tunnelled HTTP requests to a
//! service on the private network.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use burrow_core::config::{AgentSettings, load_agent_settings};
use burrow_core::tracing_init::init_tracing;

use burrow_agent::{ConnectionManager, LocalForwarder, TunnelConfig};

#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(version, about = "Burrow agent - exposes a private HTTP service through a broker")]
struct Args {
    /// JSON settings file. Flags and env vars override its values.
    #[arg(long, env = "BURROW_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Agent id, for logging. The broker identifies the agent by certificate CN.
    #[arg(long, env = "BURROW_AGENT_ID")]
    agent_id: Option<String>,

    /// Broker gRPC URL (e.g., https://broker.example.com:50051).
    #[arg(long, env = "BURROW_BROKER_URL")]
    broker_url: Option<String>,

    /// Name to verify in the broker certificate, if not the URL host.
    #[arg(long, env = "BURROW_TLS_SERVER_NAME")]
    tls_server_name: Option<String>,

    /// Agent client certificate (PEM).
    #[arg(long, env = "BURROW_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Agent client private key (PEM).
    #[arg(long, env = "BURROW_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// CA the broker certificate must chain to (PEM).
    #[arg(long, env = "BURROW_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Seconds between heartbeats.
    #[arg(long, env = "BURROW_HEARTBEAT_INTERVAL")]
    heartbeat_interval: Option<u64>,

    /// Local service receiving forwarded requests.
    #[arg(long, env = "BURROW_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// Seconds to wait for the local service.
    #[arg(long, env = "BURROW_UPSTREAM_TIMEOUT")]
    upstream_timeout: Option<u64>,

    /// Ceiling on concurrently forwarded requests.
    #[arg(long, env = "BURROW_MAX_CONCURRENT_REQUESTS")]
    max_concurrent_requests: Option<usize>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "BURROW_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(self, s: &mut AgentSettings) {
        if self.agent_id.is_some() {
            s.agent_id = self.agent_id;
        }
        if let Some(v) = self.broker_url {
            s.broker_url = v;
        }
        if self.tls_server_name.is_some() {
            s.tls_server_name = self.tls_server_name;
        }
        if let Some(v) = self.client_cert {
            s.client_cert_path = v;
        }
        if let Some(v) = self.client_key {
            s.client_key_path = v;
        }
        if let Some(v) = self.ca_cert {
            s.ca_cert_path = v;
        }
        if let Some(v) = self.heartbeat_interval {
            s.heartbeat_interval_secs = v;
        }
        if let Some(v) = self.upstream_url {
            s.upstream_url = v;
        }
        if let Some(v) = self.upstream_timeout {
            s.upstream_timeout_secs = v;
        }
        if self.max_concurrent_requests.is_some() {
            s.max_concurrent_requests = self.max_concurrent_requests;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("burrow_agent=info", args.log_json);

    let mut settings = load_agent_settings(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %settings.broker_url,
        upstream = %settings.upstream_url,
        "Starting burrow-agent"
    );

    let forwarder = LocalForwarder::new(
        &settings.upstream_url,
        settings.upstream_timeout(),
        settings.max_response_bytes,
    )?;
    let manager = ConnectionManager::new(TunnelConfig::from_settings(&settings), Arc::new(forwarder));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut runner = tokio::spawn(async move { manager.run(shutdown_rx).await });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = &mut runner => {
            // Only a fatal error ends the manager without a signal.
            if let Err(e) = result? {
                error!(error = %e, "Tunnel client stopped");
                return Err(e.into());
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    runner.await??;

    info!("Agent stopped");
    Ok(())
}
