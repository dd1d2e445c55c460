//! Dispatches envelopes read from the tunnel.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use burrow_core::ReplayGuard;
use burrow_proto::control::{CMD_HEALTH_CHECK, CMD_HEALTH_CHECK_RESPONSE, HEALTH_OK};
use burrow_proto::{ControlMessage, Envelope, EnvelopeKind, HttpExchangeRequest};

use crate::forwarder::{Forward, error_response};

/// Source tag on responses synthesized when a forward task faults.
pub const HANDLER_ERROR_SOURCE: &str = "agent";

/// Handles envelopes for one tunnel session.
///
/// Every accepted request produces exactly one response envelope on the
/// session's outbound queue, even if forwarding panics.
pub struct RequestHandler {
    forwarder: Arc<dyn Forward>,
    outbound: mpsc::UnboundedSender<Envelope>,
    limiter: Option<Arc<Semaphore>>,
    replay: ReplayGuard,
}

impl RequestHandler {
    pub fn new(
        forwarder: Arc<dyn Forward>,
        outbound: mpsc::UnboundedSender<Envelope>,
        max_concurrent: Option<usize>,
    ) -> Self {
        Self {
            forwarder,
            outbound,
            limiter: max_concurrent.map(|n| Arc::new(Semaphore::new(n))),
            replay: ReplayGuard::new(),
        }
    }

    /// Handle one inbound envelope. Requests run on their own task, so this
    /// returns without waiting for the upstream.
    pub fn handle(&self, envelope: Envelope) {
        if !self
            .replay
            .accept(&envelope.message_id, envelope.timestamp_ms)
        {
            debug!(message_id = %envelope.message_id, "Dropping stale or replayed envelope");
            return;
        }

        match envelope.into_kind() {
            EnvelopeKind::Request(req) => self.spawn_forward(req),
            EnvelopeKind::Control(ctl) => self.handle_control(&ctl),
            EnvelopeKind::Heartbeat => debug!("Heartbeat from broker"),
            EnvelopeKind::Response(resp) => {
                warn!(request_id = %resp.request_id, "Broker sent a response envelope, ignoring");
            }
            EnvelopeKind::Malformed(kind) => {
                warn!(kind = ?kind, "Envelope payload does not match its type");
            }
            EnvelopeKind::Unrecognized(raw) => {
                warn!(message_type = raw, "Unrecognized envelope type");
            }
        }
    }

    fn spawn_forward(&self, req: HttpExchangeRequest) {
        let forwarder = Arc::clone(&self.forwarder);
        let outbound = self.outbound.clone();
        let limiter = self.limiter.clone();

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };

            let request_id = req.request_id.clone();
            // Run the forward on its own task so a panic surfaces as a JoinError.
            let response = match tokio::spawn(async move { forwarder.forward(req).await }).await {
                Ok(resp) => resp,
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Forward task failed");
                    error_response(&request_id, 500, "Internal agent error", HANDLER_ERROR_SOURCE)
                }
            };

            if outbound.send(Envelope::response(response)).is_err() {
                warn!(request_id = %request_id, "Outbound channel closed while sending response");
            }
        });
    }

    fn handle_control(&self, ctl: &ControlMessage) {
        match ctl.command.as_str() {
            CMD_HEALTH_CHECK => {
                debug!("Health check requested");
                let reply = Envelope::control(CMD_HEALTH_CHECK_RESPONSE, HEALTH_OK);
                if self.outbound.send(reply).is_err() {
                    warn!("Outbound channel closed while answering health check");
                }
            }
            other => info!(command = %other, data = %ctl.data, "Unknown control command, ignoring"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "handler_tests.rs"]
mod tests;
