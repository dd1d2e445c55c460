//! TunnelService gRPC implementation.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument, warn};

use burrow_proto::tunnel_service_server::TunnelService;
use burrow_proto::{Envelope, EnvelopeKind, PingRequest, PingResponse, now_ms};

use crate::registry::{RegistryError, SessionGuard, TunnelRegistry};

type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Envelope, Status>> + Send>>;

pub struct TunnelServiceImpl {
    registry: Arc<dyn TunnelRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl TunnelServiceImpl {
    pub fn new(registry: Arc<dyn TunnelRegistry>, shutdown: watch::Receiver<bool>) -> Self {
        Self { registry, shutdown }
    }

    /// Register `agent_id` and start reading `inbound` in the background.
    ///
    /// Split from [`TunnelService::establish_tunnel`] so it can be driven
    /// without a TLS transport.
    pub fn open_session<S>(&self, agent_id: &str, inbound: S) -> Result<EnvelopeStream, Status>
    where
        S: Stream<Item = Result<Envelope, Status>> + Unpin + Send + 'static,
    {
        let (handle, outbound) = self.registry.register(agent_id).map_err(|e| match e {
            RegistryError::AlreadyConnected(active) => Status::already_exists(format!(
                "Another agent session is active ({active}); connection rejected"
            )),
            other => Status::internal(other.to_string()),
        })?;
        info!(agent_id = %agent_id, session_id = handle.session_id, "Tunnel opened");

        let guard = SessionGuard::new(Arc::clone(&self.registry), handle);
        tokio::spawn(run_session(guard, inbound, self.shutdown.clone()));

        Ok(Box::pin(UnboundedReceiverStream::new(outbound).map(Ok)))
    }
}

/// Agent id from the verified client certificate's CN.
pub fn peer_agent_id<T>(request: &Request<T>) -> Result<String, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("Client certificate required"))?;
    certs
        .first()
        .and_then(|leaf| burrow_pki::common_name(leaf))
        .ok_or_else(|| Status::unauthenticated("Client certificate has no common name"))
}

/// Read loop for one session. Dropping `guard` on return unregisters it.
async fn run_session<S>(guard: SessionGuard, mut inbound: S, mut shutdown: watch::Receiver<bool>)
where
    S: Stream<Item = Result<Envelope, Status>> + Unpin + Send + 'static,
{
    let handle = guard.handle().clone();
    let registry = Arc::clone(guard.registry());
    let mut received = 0u64;

    loop {
        let next = tokio::select! {
            next = inbound.next() => next,
            _ = shutdown.changed() => {
                info!(agent_id = %handle.agent_id, "Shutdown requested, closing tunnel");
                break;
            }
        };

        let envelope = match next {
            Some(Ok(envelope)) => envelope,
            Some(Err(status)) => {
                warn!(agent_id = %handle.agent_id, error = %status, "Tunnel stream error");
                break;
            }
            None => break,
        };
        received += 1;

        if !registry.accept_inbound(&handle, &envelope) {
            debug!(
                agent_id = %handle.agent_id,
                message_id = %envelope.message_id,
                "Dropping stale or replayed envelope"
            );
            continue;
        }

        match envelope.into_kind() {
            EnvelopeKind::Response(response) => registry.receive_response(&handle, response),
            EnvelopeKind::Heartbeat => {
                debug!(agent_id = %handle.agent_id, "Heartbeat");
                registry.touch(&handle);
            }
            EnvelopeKind::Control(ctl) => {
                info!(
                    agent_id = %handle.agent_id,
                    command = %ctl.command,
                    data = %ctl.data,
                    "Control message from agent"
                );
            }
            EnvelopeKind::Request(req) => {
                warn!(
                    agent_id = %handle.agent_id,
                    request_id = %req.request_id,
                    "Agent sent a request envelope, ignoring"
                );
            }
            EnvelopeKind::Malformed(kind) => {
                warn!(agent_id = %handle.agent_id, kind = ?kind, "Envelope payload does not match its type");
            }
            EnvelopeKind::Unrecognized(raw) => {
                warn!(agent_id = %handle.agent_id, message_type = raw, "Unrecognized envelope type");
            }
        }
    }

    info!(agent_id = %handle.agent_id, received, "Tunnel closed");
}

#[tonic::async_trait]
impl TunnelService for TunnelServiceImpl {
    type EstablishTunnelStream = EnvelopeStream;

    #[instrument(skip(self, request), fields(rpc = "Ping"))]
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let sent = request.into_inner().timestamp;
        debug!(client_timestamp = sent, "Ping");
        Ok(Response::new(PingResponse {
            timestamp: now_ms(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "EstablishTunnel"))]
    async fn establish_tunnel(
        &self,
        request: Request<Streaming<Envelope>>,
    ) -> Result<Response<Self::EstablishTunnelStream>, Status> {
        let agent_id = peer_agent_id(&request)?;
        let stream = self.open_session(&agent_id, request.into_inner())?;
        Ok(Response::new(stream))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "tunnel_svc_tests.rs"]
mod tests;
