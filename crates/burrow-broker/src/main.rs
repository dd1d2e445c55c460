//! Burrow Broker
//!
//! Accepts the agent's mTLS tunnel over gRPC and serves the public HTTP
//! gateway that sends requests down it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use burrow_core::config::{BrokerSettings, load_broker_settings};
use burrow_core::tracing_init::init_tracing;
use burrow_proto::MAX_ENVELOPE_BYTES;
use burrow_proto::tunnel_service_server::TunnelServiceServer;

use burrow_broker::gateway::{AppState, GatewaySettings, build_router};
use burrow_broker::registry::{SingleSessionRegistry, TunnelRegistry};
use burrow_broker::routing::FileDomainRouter;
use burrow_broker::server::TunnelServiceImpl;
use burrow_broker::tls::TlsMode;

#[derive(Parser, Debug)]
#[command(name = "burrow-broker")]
#[command(version, about = "Burrow broker - public HTTP gateway and agent tunnel endpoint")]
struct Args {
    /// JSON settings file. Flags and env vars override its values.
    #[arg(long, env = "BURROW_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the agent tunnel (gRPC over mTLS).
    #[arg(long, env = "BURROW_GRPC_ADDR")]
    grpc_addr: Option<SocketAddr>,

    /// Address for the public HTTP gateway.
    #[arg(long, env = "BURROW_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Server certificate (PEM).
    #[arg(long, env = "BURROW_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// Server private key (PEM).
    #[arg(long, env = "BURROW_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// CA that signs agent client certificates (PEM).
    #[arg(long, env = "BURROW_CLIENT_CA")]
    client_ca: Option<PathBuf>,

    /// Generate a CA, server and agent certificate for local development.
    #[arg(long, env = "BURROW_DEV_TLS")]
    dev_tls: bool,

    /// Directory for --dev-tls material.
    #[arg(long, env = "BURROW_DEV_TLS_DIR")]
    dev_tls_dir: Option<PathBuf>,

    /// CN of the agent certificate generated by --dev-tls.
    #[arg(long, env = "BURROW_DEV_AGENT_ID", default_value = "dev-agent")]
    dev_agent_id: String,

    /// Domain routing table (JSON).
    #[arg(long, env = "BURROW_ROUTES_FILE")]
    routes_file: Option<PathBuf>,

    /// Shared secret for /admin endpoints.
    #[arg(long, env = "BURROW_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Seconds to wait for the agent's response.
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Largest accepted request body, in bytes.
    #[arg(long, env = "BURROW_MAX_BODY_BYTES")]
    max_body_bytes: Option<usize>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "BURROW_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(self, s: &mut BrokerSettings) {
        if let Some(v) = self.grpc_addr {
            s.grpc_addr = v.to_string();
        }
        if let Some(v) = self.http_addr {
            s.http_addr = v.to_string();
        }
        if self.tls_cert.is_some() {
            s.server_cert_path = self.tls_cert;
        }
        if self.tls_key.is_some() {
            s.server_key_path = self.tls_key;
        }
        if self.client_ca.is_some() {
            s.client_ca_path = self.client_ca;
        }
        s.dev_tls |= self.dev_tls;
        if self.dev_tls_dir.is_some() {
            s.dev_tls_dir = self.dev_tls_dir;
        }
        if let Some(v) = self.routes_file {
            s.routes_file = v;
        }
        if self.admin_token.is_some() {
            s.admin_token = self.admin_token;
        }
        if let Some(v) = self.request_timeout {
            s.request_timeout_secs = v;
        }
        if let Some(v) = self.max_body_bytes {
            s.max_body_bytes = v;
        }
    }
}

fn tls_mode(settings: &BrokerSettings, dev_agent_id: &str) -> anyhow::Result<TlsMode> {
    if settings.dev_tls {
        let cert_dir = match &settings.dev_tls_dir {
            Some(dir) => dir.clone(),
            None => TlsMode::default_dev_dir()?,
        };
        return Ok(TlsMode::DevSelfSigned {
            cert_dir,
            agent_id: dev_agent_id.to_string(),
        });
    }
    match (
        &settings.server_cert_path,
        &settings.server_key_path,
        &settings.client_ca_path,
    ) {
        (Some(cert), Some(key), Some(ca)) => Ok(TlsMode::Custom {
            cert_path: cert.clone(),
            key_path: key.clone(),
            client_ca_path: ca.clone(),
        }),
        _ => anyhow::bail!("--tls-cert, --tls-key and --client-ca are required without --dev-tls"),
    }
}

async fn wait_for_shutdown(mut rx: tokio::sync::watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("burrow_broker=info", args.log_json);
    burrow_pki::ensure_crypto_provider();

    let dev_agent_id = args.dev_agent_id.clone();
    let mut settings = load_broker_settings(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;

    let grpc_addr: SocketAddr = settings
        .grpc_addr
        .parse()
        .with_context(|| format!("invalid grpc_addr {}", settings.grpc_addr))?;
    let http_addr: SocketAddr = settings
        .http_addr
        .parse()
        .with_context(|| format!("invalid http_addr {}", settings.http_addr))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        grpc_addr = %grpc_addr,
        http_addr = %http_addr,
        "Starting burrow-broker"
    );

    let tls = tls_mode(&settings, &dev_agent_id)?.to_server_tls_config()?;
    let routes = Arc::new(FileDomainRouter::load(&settings.routes_file)?);
    let registry: Arc<dyn TunnelRegistry> = Arc::new(SingleSessionRegistry::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let tunnel = TunnelServiceImpl::new(Arc::clone(&registry), shutdown_rx.clone());
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<TunnelServiceServer<TunnelServiceImpl>>()
        .await;

    let grpc = Server::builder()
        .tls_config(tls)?
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_service(health_service)
        .add_service(
            TunnelServiceServer::new(tunnel)
                .max_decoding_message_size(MAX_ENVELOPE_BYTES)
                .max_encoding_message_size(MAX_ENVELOPE_BYTES),
        )
        .serve_with_shutdown(grpc_addr, wait_for_shutdown(shutdown_rx.clone()));

    let app = build_router(AppState {
        registry,
        routes,
        settings: GatewaySettings {
            request_timeout: settings.request_timeout(),
            max_body_bytes: settings.max_body_bytes,
            admin_token: settings.admin_token.clone(),
        },
    });
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
    .into_future();

    let grpc_handle = tokio::spawn(grpc);
    let http_handle = tokio::spawn(http);
    info!("Broker ready");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    grpc_handle.await??;
    http_handle.await??;

    info!("Broker stopped");
    Ok(())
}
