//! Registry admitting a single agent session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use burrow_core::ReplayGuard;
use burrow_proto::{Envelope, HttpExchangeRequest, HttpExchangeResponse};

use super::{PendingTable, RegistryError, SessionHandle, SessionInfo, TunnelRegistry};

struct Session {
    handle: SessionHandle,
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: Arc<PendingTable>,
    inbound_guard: ReplayGuard,
    outbound_guard: ReplayGuard,
    connected_at: DateTime<Utc>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

/// At most one active session. A second `register` while one is active
/// fails with [`RegistryError::AlreadyConnected`].
pub struct SingleSessionRegistry {
    active: RwLock<Option<Arc<Session>>>,
    next_session_id: AtomicU64,
}

impl SingleSessionRegistry {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Active session, if it belongs to `agent_id`.
    fn session_for(&self, agent_id: &str) -> Option<Arc<Session>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|s| s.handle.agent_id == agent_id)
            .cloned()
    }

    /// Active session, if it is exactly `handle`.
    fn session_by_handle(&self, handle: &SessionHandle) -> Option<Arc<Session>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|s| s.handle == *handle)
            .cloned()
    }
}

impl Default for SingleSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl TunnelRegistry for SingleSessionRegistry {
    fn register(
        &self,
        agent_id: &str,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<Envelope>), RegistryError> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = active.as_ref() {
            warn!(
                agent_id = %agent_id,
                active_agent = %existing.handle.agent_id,
                "Rejecting tunnel: a session is already active"
            );
            return Err(RegistryError::AlreadyConnected(
                existing.handle.agent_id.clone(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            agent_id: agent_id.to_string(),
            session_id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
        };
        *active = Some(Arc::new(Session {
            handle: handle.clone(),
            outbound: tx,
            pending: PendingTable::new(),
            inbound_guard: ReplayGuard::new(),
            outbound_guard: ReplayGuard::new(),
            connected_at: Utc::now(),
            last_heartbeat: Mutex::new(None),
        }));
        drop(active);

        info!(agent_id = %agent_id, session_id = handle.session_id, "Tunnel session registered");
        Ok((handle, rx))
    }

    fn unregister(&self, session: &SessionHandle) {
        let removed = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().is_some_and(|s| s.handle == *session) {
                active.take()
            } else {
                None
            }
        };
        match removed {
            Some(s) => {
                let dropped = s.pending.cancel_all();
                info!(
                    agent_id = %session.agent_id,
                    session_id = session.session_id,
                    dropped_pending = dropped,
                    "Tunnel session unregistered"
                );
            }
            None => debug!(
                agent_id = %session.agent_id,
                session_id = session.session_id,
                "Unregister for inactive session ignored"
            ),
        }
    }

    async fn send_request(
        &self,
        agent_id: &str,
        request: HttpExchangeRequest,
        timeout: Duration,
    ) -> Result<HttpExchangeResponse, RegistryError> {
        let session = self
            .session_for(agent_id)
            .ok_or_else(|| RegistryError::AgentOffline(agent_id.to_string()))?;

        let pending = session.pending.insert(&request.request_id)?;
        let envelope = Envelope::request(request);
        if session
            .outbound_guard
            .accept(&envelope.message_id, envelope.timestamp_ms)
        {
            session
                .outbound
                .send(envelope)
                .map_err(|_| RegistryError::AgentOffline(agent_id.to_string()))?;
        }

        let result = pending.wait(timeout).await;
        if let Err(RegistryError::Timeout(request_id)) = &result {
            warn!(agent_id = %agent_id, request_id = %request_id, "Request timed out");
        }
        result
    }

    fn receive_response(&self, session: &SessionHandle, response: HttpExchangeResponse) {
        let request_id = response.request_id.clone();
        let delivered = self
            .session_by_handle(session)
            .is_some_and(|s| s.pending.complete(response));
        if !delivered {
            warn!(
                agent_id = %session.agent_id,
                request_id = %request_id,
                "No pending waiter for response, dropping"
            );
        }
    }

    fn accept_inbound(&self, session: &SessionHandle, envelope: &Envelope) -> bool {
        self.session_by_handle(session).is_some_and(|s| {
            s.inbound_guard
                .accept(&envelope.message_id, envelope.timestamp_ms)
        })
    }

    fn touch(&self, session: &SessionHandle) {
        if let Some(s) = self.session_by_handle(session) {
            *s.last_heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        }
    }

    fn is_connected(&self, agent_id: &str) -> bool {
        self.session_for(agent_id).is_some()
    }

    fn session_info(&self) -> Option<SessionInfo> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active.as_ref().map(|s| SessionInfo {
            agent_id: s.handle.agent_id.clone(),
            session_id: s.handle.session_id,
            connected_at: s.connected_at,
            last_heartbeat: *s
                .last_heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            pending_requests: s.pending.len(),
        })
    }
}
