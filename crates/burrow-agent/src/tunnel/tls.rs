//! mTLS transport to the broker.
//!
//! tonic's built-in TLS cannot take a custom verifier, so the channel is
//! given a plaintext endpoint and TLS is done inside the connector with
//! `tokio-rustls` and [`PinnedCaVerifier`].

use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

use burrow_pki::PinnedCaVerifier;

use super::config::TunnelConfig;
use super::error::TunnelClientError;

/// Client TLS material loaded for one connection attempt.
pub struct AgentTls {
    pub config: Arc<ClientConfig>,
    /// CN of the client certificate, which the broker uses as the agent id.
    pub common_name: Option<String>,
}

/// Load the client certificate, key and pinned CA.
///
/// Every failure here is a [`TunnelClientError::Certificate`].
pub fn load_client_tls(config: &TunnelConfig) -> Result<AgentTls, TunnelClientError> {
    burrow_pki::ensure_crypto_provider();

    let chain = burrow_pki::load_certs(&config.client_cert_path)?;
    let key = burrow_pki::load_private_key(&config.client_key_path)?;
    let ca = burrow_pki::load_certs(&config.ca_cert_path)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            TunnelClientError::Certificate(format!(
                "no CA certificate in {}",
                config.ca_cert_path.display()
            ))
        })?;

    let common_name = chain.first().and_then(|leaf| burrow_pki::common_name(leaf));
    let verifier = PinnedCaVerifier::new(ca)?;
    info!(
        client_cert = %config.client_cert_path.display(),
        common_name = common_name.as_deref().unwrap_or("<none>"),
        pinned_ca = %verifier.pinned_thumbprint(),
        "Client certificate loaded"
    );

    let mut tls = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TunnelClientError::Certificate(e.to_string()))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(verifier))
    .with_client_auth_cert(chain, key)
    .map_err(|e| TunnelClientError::Certificate(format!("client certificate: {e}")))?;
    tls.alpn_protocols = vec![b"h2".to_vec()];

    Ok(AgentTls {
        config: Arc::new(tls),
        common_name,
    })
}

/// Where to dial and which name to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
    pub server_name: String,
}

impl BrokerAddr {
    pub fn parse(url: &str, server_name: Option<&str>) -> Result<Self, TunnelClientError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| TunnelClientError::Config(format!("invalid broker url {url}: {e}")))?;
        let host = uri
            .host()
            .ok_or_else(|| TunnelClientError::Config(format!("broker url has no host: {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("http") { 80 } else { 443 });
        Ok(Self {
            server_name: server_name.map_or_else(|| host.clone(), str::to_string),
            host,
            port,
        })
    }
}

/// Open an HTTP/2 channel to the broker over mTLS.
pub async fn connect(
    addr: &BrokerAddr,
    tls: Arc<ClientConfig>,
) -> Result<Channel, TunnelClientError> {
    let server_name = ServerName::try_from(addr.server_name.clone()).map_err(|e| {
        TunnelClientError::Config(format!("invalid TLS server name {}: {e}", addr.server_name))
    })?;

    let authority = if addr.host.contains(':') {
        format!("[{}]:{}", addr.host, addr.port)
    } else {
        format!("{}:{}", addr.host, addr.port)
    };
    let endpoint = Endpoint::from_shared(format!("http://{authority}"))
        .map_err(|e| TunnelClientError::Config(e.to_string()))?
        .connect_timeout(Duration::from_secs(10))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10));

    let connector = TlsConnector::from(tls);
    let host = addr.host.clone();
    let port = addr.port;

    endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let connector = connector.clone();
            let server_name = server_name.clone();
            let host = host.clone();
            async move {
                let tcp = TcpStream::connect((host.as_str(), port)).await?;
                tcp.set_nodelay(true)?;
                let stream = connector.connect(server_name, tcp).await?;
                debug!(host = %host, port, "TLS handshake complete");
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| {
            debug!(error = ?e, "connection error details");
            TunnelClientError::Connection(format!("{e}: {}", error_chain(&e)))
        })
}

/// Walk the `source()` chain of an error and join into a single string.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}
