//! Tunnel registry: who is connected and how to reach them.
//!
//! Callers only see the [`TunnelRegistry`] trait. The shipped implementation,
//! [`SingleSessionRegistry`], admits one agent session at a time; a keyed
//! multi-agent registry can implement the same trait.

mod pending;
mod session;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use burrow_proto::{Envelope, HttpExchangeRequest, HttpExchangeResponse};

pub use pending::{PendingResponse, PendingTable};
pub use session::SingleSessionRegistry;

/// Identifies one registered session. Returned by [`TunnelRegistry::register`]
/// and required to unregister it, so a late cleanup of an old session can
/// never evict a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub agent_id: String,
    pub session_id: u64,
}

/// Point-in-time view of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub agent_id: String,
    pub session_id: u64,
    pub connected_at: DateTime<Utc>,
    /// `None` until the first heartbeat arrives.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pending_requests: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent already connected: {0}")]
    AlreadyConnected(String),

    #[error("Agent offline: {0}")]
    AgentOffline(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Response channel dropped: {0}")]
    ResponseDropped(String),

    #[error("Duplicate request id: {0}")]
    DuplicateRequest(String),
}

/// Session store plus request/response correlation.
#[tonic::async_trait]
pub trait TunnelRegistry: Send + Sync {
    /// Admit a new session for `agent_id`.
    ///
    /// The returned receiver is the session's single outbound queue; whoever
    /// drains it is the only writer to the agent.
    fn register(
        &self,
        agent_id: &str,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<Envelope>), RegistryError>;

    /// Remove the session. Unknown or already-removed handles are ignored.
    fn unregister(&self, session: &SessionHandle);

    /// Send `request` to `agent_id` and wait up to `timeout` for its response.
    async fn send_request(
        &self,
        agent_id: &str,
        request: HttpExchangeRequest,
        timeout: Duration,
    ) -> Result<HttpExchangeResponse, RegistryError>;

    /// Deliver a response from the agent to whoever is waiting for it.
    fn receive_response(&self, session: &SessionHandle, response: HttpExchangeResponse);

    /// Replay/freshness check for an envelope read from `session`.
    fn accept_inbound(&self, session: &SessionHandle, envelope: &Envelope) -> bool;

    /// Record a heartbeat from `session`.
    fn touch(&self, session: &SessionHandle);

    fn is_connected(&self, agent_id: &str) -> bool;

    fn session_info(&self) -> Option<SessionInfo>;
}

/// Unregisters its session when dropped.
///
/// Held by the task that reads the agent's stream, so every way out of that
/// task (end of stream, error, shutdown, panic) releases the session once.
pub struct SessionGuard {
    registry: Arc<dyn TunnelRegistry>,
    handle: SessionHandle,
}

impl SessionGuard {
    pub fn new(registry: Arc<dyn TunnelRegistry>, handle: SessionHandle) -> Self {
        Self { registry, handle }
    }

    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<dyn TunnelRegistry> {
        &self.registry
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.handle);
    }
}
