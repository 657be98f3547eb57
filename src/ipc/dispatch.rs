//! Message routing.
//!
//! The [`Dispatcher`] sits at the end of the ingestion path and must never
//! block it. Responses complete their tracker entry directly (a `oneshot`
//! send). Notifications are queued for a separate pump task that runs the
//! registered handler. Requests initiated by the backend each get their own
//! task, which answers with the handler's reply or `Method not found`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::codec::{Message, Reply, RpcError};
use super::connection::ConnectionStats;
use super::outbound::Outbound;
use super::tracker::RequestTracker;

/// Handler for a backend notification.
///
/// Runs on the connection's notification pump, one at a time, in arrival
/// order. Slow handlers delay later notifications but never frame parsing.
pub trait NotificationHandler: Send + Sync + 'static {
    fn handle(&self, params: Value);
}

impl<F> NotificationHandler for F
where
    F: Fn(Value) + Send + Sync + 'static,
{
    fn handle(&self, params: Value) {
        self(params)
    }
}

/// Handler for a request initiated by the backend.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, params: Value) -> Reply;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    async fn handle(&self, params: Value) -> Reply {
        self(params).await
    }
}

/// Method name → handler tables.
///
/// One handler per method; registering again replaces the previous handler
/// (last registration wins). The registry outlives individual connections,
/// so handlers survive a backend restart.
#[derive(Default)]
pub struct HandlerRegistry {
    notifications: RwLock<HashMap<String, Arc<dyn NotificationHandler>>>,
    requests: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification handler. Returns true if one was replaced.
    pub fn on_notification<H>(&self, method: impl Into<String>, handler: H) -> bool
    where
        H: NotificationHandler,
    {
        self.notifications
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), Arc::new(handler))
            .is_some()
    }

    /// Register a handler for backend-initiated requests. Returns true if
    /// one was replaced.
    pub fn on_request<H>(&self, method: impl Into<String>, handler: H) -> bool
    where
        H: RequestHandler,
    {
        self.requests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), Arc::new(handler))
            .is_some()
    }

    pub fn remove_notification(&self, method: &str) -> bool {
        self.notifications
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(method)
            .is_some()
    }

    pub fn remove_request(&self, method: &str) -> bool {
        self.requests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(method)
            .is_some()
    }

    pub fn notification_handler(&self, method: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.notifications
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .cloned()
    }

    pub fn request_handler(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .cloned()
    }
}

/// Routes decoded messages for one connection.
pub struct Dispatcher {
    tracker: Arc<RequestTracker>,
    registry: Arc<HandlerRegistry>,
    outbound: Arc<Outbound>,
    stats: Arc<ConnectionStats>,
    notifications: mpsc::UnboundedSender<(String, Value)>,
}

impl Dispatcher {
    /// Build a dispatcher and spawn its notification pump.
    ///
    /// The pump ends once the dispatcher is dropped and the queue drains.
    pub fn new(
        tracker: Arc<RequestTracker>,
        registry: Arc<HandlerRegistry>,
        outbound: Arc<Outbound>,
        stats: Arc<ConnectionStats>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(notification_pump(Arc::clone(&registry), rx));
        let dispatcher = Self {
            tracker,
            registry,
            outbound,
            stats,
            notifications: tx,
        };
        (dispatcher, pump)
    }

    pub fn on_message(&self, message: Message) {
        match message {
            Message::Response { id, result } => {
                if !self.tracker.resolve(id, result) {
                    self.stats.unmatched_responses.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropping response for unknown request id {}", id);
                }
            }
            Message::Notification { method, params } => {
                if self.notifications.send((method, params)).is_err() {
                    debug!("Notification pump stopped; dropping notification");
                }
            }
            Message::Request { id, method, params } => {
                self.spawn_server_request(id, method, params);
            }
        }
    }

    fn spawn_server_request(&self, id: i64, method: String, params: Value) {
        let handler = self.registry.request_handler(&method);
        let outbound = Arc::clone(&self.outbound);

        tokio::spawn(async move {
            let reply = match handler {
                Some(handler) => handler.handle(params).await,
                None => {
                    debug!("No handler for backend request {} ({})", method, id);
                    Err(RpcError::method_not_found(&method))
                }
            };
            if let Err(e) = outbound.send(&Message::response(id, reply)).await {
                warn!("Failed to answer backend request {} ({}): {}", method, id, e);
            }
        });
    }
}

async fn notification_pump(
    registry: Arc<HandlerRegistry>,
    mut rx: mpsc::UnboundedReceiver<(String, Value)>,
) {
    while let Some((method, params)) = rx.recv().await {
        let Some(handler) = registry.notification_handler(&method) else {
            trace!("Ignoring notification {} (no handler)", method);
            continue;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(params))).is_err() {
            warn!("Handler for notification {} panicked", method);
        }
    }
}
