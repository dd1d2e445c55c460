//! Requests waiting for their response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use burrow_proto::HttpExchangeResponse;

use super::RegistryError;

#[derive(Debug)]
struct Waiter {
    /// Distinguishes reuses of the same `request_id`.
    token: u64,
    tx: oneshot::Sender<HttpExchangeResponse>,
}

type Waiters = HashMap<String, Waiter>;

/// Pending waiters keyed by `request_id`.
#[derive(Debug, Default)]
pub struct PendingTable {
    waiters: Mutex<Waiters>,
    next_token: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter. The entry lives exactly as long as the returned
    /// [`PendingResponse`] unless a response removes it first.
    pub fn insert(self: &Arc<Self>, request_id: &str) -> Result<PendingResponse, RegistryError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        if waiters.contains_key(request_id) {
            return Err(RegistryError::DuplicateRequest(request_id.to_string()));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        waiters.insert(request_id.to_string(), Waiter { token, tx });
        drop(waiters);
        Ok(PendingResponse {
            table: Arc::clone(self),
            request_id: request_id.to_string(),
            token,
            rx,
        })
    }

    /// Resolve the waiter for `response.request_id`. Returns `false` when
    /// nobody is waiting (timed out, cancelled or never sent).
    pub fn complete(&self, response: HttpExchangeResponse) -> bool {
        let Some(waiter) = self.lock().remove(&response.request_id) else {
            return false;
        };
        let request_id = response.request_id.clone();
        if waiter.tx.send(response).is_err() {
            warn!(request_id = %request_id, "Waiter went away before response delivery");
            return false;
        }
        true
    }

    // Only the entry this handle inserted; a later waiter that reused the
    // id stays.
    fn remove(&self, request_id: &str, token: u64) {
        let mut waiters = self.lock();
        if waiters.get(request_id).is_some_and(|w| w.token == token) {
            waiters.remove(request_id);
        }
    }

    /// Drop every waiter; they observe [`RegistryError::ResponseDropped`].
    pub fn cancel_all(&self) -> usize {
        let mut waiters = self.lock();
        let n = waiters.len();
        waiters.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle on one pending request. Dropping it removes the table entry.
#[derive(Debug)]
pub struct PendingResponse {
    table: Arc<PendingTable>,
    request_id: String,
    token: u64,
    rx: oneshot::Receiver<HttpExchangeResponse>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response or `timeout`, whichever comes first.
    pub async fn wait(mut self, timeout: Duration) -> Result<HttpExchangeResponse, RegistryError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RegistryError::ResponseDropped(self.request_id.clone())),
            Err(_) => Err(RegistryError::Timeout(self.request_id.clone())),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.remove(&self.request_id, self.token);
    }
}
