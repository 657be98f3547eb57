//! Request/response correlation.
//!
//! Every outgoing request gets a fresh id and a `oneshot` completion parked
//! in the pending map. The reader task resolves entries by id as responses
//! arrive, in whatever order the backend produces them. Tearing the channel
//! down completes everything still pending with a transport failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use super::codec::{Reply, RequestId};
use crate::error::ClientError;

/// What a pending request is eventually completed with.
pub type Completion = Result<Reply, ClientError>;

/// Sending half of a pending request.
pub type CompletionSender = oneshot::Sender<Completion>;

#[derive(Default)]
struct PendingState {
    pending: HashMap<RequestId, CompletionSender>,
    /// Set by `fail_all`; later `track` calls are rejected with this reason.
    closed: Option<String>,
}

/// Issues request ids and owns the pending-completion map.
pub struct RequestTracker {
    next_id: AtomicI64,
    state: Mutex<PendingState>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            state: Mutex::new(PendingState::default()),
        }
    }

    /// Next request id. Strictly increasing from 1, never reused.
    pub fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Park `completion` under `id` until a response or teardown.
    ///
    /// Fails if the tracker was already torn down, so a request issued after
    /// the backend died cannot wait forever.
    pub fn track(&self, id: RequestId, completion: CompletionSender) -> Result<(), ClientError> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(ClientError::TransportClosed(reason.clone()));
        }
        state.pending.insert(id, completion);
        Ok(())
    }

    /// Register a new request and return its id plus the receiver to await.
    pub fn register(&self) -> Result<(RequestId, oneshot::Receiver<Completion>), ClientError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.track(id, tx)?;
        Ok((id, rx))
    }

    /// Complete the request `id` with the backend's reply.
    ///
    /// Returns false when nothing is pending under `id` (unknown, stale, or
    /// already answered). A caller that stopped waiting still counts as a
    /// match; its reply is discarded.
    pub fn resolve(&self, id: RequestId, reply: Reply) -> bool {
        let sender = self.lock().pending.remove(&id);
        match sender {
            Some(tx) => {
                if tx.send(Ok(reply)).is_err() {
                    debug!("Caller for request {} stopped waiting; reply discarded", id);
                }
                true
            }
            None => false,
        }
    }

    /// Drop a pending entry without completing it (e.g. its write failed).
    pub fn forget(&self, id: RequestId) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Complete every pending request with a transport failure and refuse
    /// new ones. Returns how many requests were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, CompletionSender)> = {
            let mut state = self.lock();
            state.closed.get_or_insert_with(|| reason.to_string());
            state.pending.drain().collect()
        };

        let count = drained.len();
        for (id, tx) in drained {
            debug!("Failing pending request {}: {}", id, reason);
            let _ = tx.send(Err(ClientError::TransportClosed(reason.to_string())));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        // The map stays consistent even if a holder panicked: every critical
        // section is a single insert/remove/drain.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
