//! One live protocol channel to a backend.
//!
//! A [`Connection`] pairs a reader task with a shared writer. The reader task
//! is the only consumer of inbound bytes: it feeds the [`Framer`], decodes
//! each frame, and hands the message to the [`Dispatcher`], strictly in the
//! order frames complete. Callers send concurrently through [`Outbound`].
//!
//! The channel can be anything byte-oriented: a child's stdio pipes (see
//! `supervisor`) or a Unix domain socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{decode, Message, Reply, RequestId};
use super::dispatch::{Dispatcher, HandlerRegistry};
use super::framing::{Framer, DEFAULT_MAX_MESSAGE_SIZE};
use super::outbound::Outbound;
use super::tracker::{Completion, RequestTracker};
use crate::error::ClientError;

/// Size of each read from the inbound stream.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Method of the protocol-level cancellation notification.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// Counters for faults the connection absorbed instead of surfacing.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub frames: AtomicU64,
    pub decode_errors: AtomicU64,
    pub unmatched_responses: AtomicU64,
    pub resyncs: AtomicU64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub decode_errors: u64,
    pub unmatched_responses: u64,
    pub resyncs: u64,
}

/// A request that has been written and is awaiting its response.
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Completion>,
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the backend's reply or a transport failure.
    pub async fn wait(self) -> Result<Reply, ClientError> {
        match self.rx.await {
            Ok(completion) => completion,
            Err(_) => Err(ClientError::TransportClosed(
                "request abandoned without a reply".to_string(),
            )),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `limit`.
    ///
    /// The request stays registered, so a late response is absorbed silently.
    pub async fn wait_timeout(self, limit: Duration) -> Result<Reply, ClientError> {
        tokio::time::timeout(limit, self.wait())
            .await
            .unwrap_or(Err(ClientError::Timeout(limit)))
    }
}

/// Live channel to a backend.
pub struct Connection {
    tracker: Arc<RequestTracker>,
    outbound: Arc<Outbound>,
    stats: Arc<ConnectionStats>,
    closed_rx: watch::Receiver<Option<String>>,
    reader_handle: JoinHandle<()>,
}

impl Connection {
    /// Start a connection over an arbitrary reader/writer pair.
    pub fn open<R, W>(reader: R, writer: W, registry: Arc<HandlerRegistry>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::open_with_limit(reader, writer, registry, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn open_with_limit<R, W>(
        reader: R,
        writer: W,
        registry: Arc<HandlerRegistry>,
        max_message_size: usize,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let tracker = Arc::new(RequestTracker::new());
        let outbound = Arc::new(Outbound::new(writer));
        let stats = Arc::new(ConnectionStats::default());
        let (closed_tx, closed_rx) = watch::channel(None);

        let (dispatcher, _pump) = Dispatcher::new(
            Arc::clone(&tracker),
            registry,
            Arc::clone(&outbound),
            Arc::clone(&stats),
        );

        let reader_handle = tokio::spawn(read_loop(
            reader,
            Framer::with_max_message_size(max_message_size),
            dispatcher,
            Arc::clone(&tracker),
            Arc::clone(&stats),
            closed_tx,
        ));

        Self {
            tracker,
            outbound,
            stats,
            closed_rx,
            reader_handle,
        }
    }

    /// Connect to a backend listening on a Unix domain socket.
    #[cfg(unix)]
    pub async fn connect_unix(
        socket_path: &std::path::Path,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, ClientError> {
        let stream = tokio::net::UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::ConnectionFailed)?;
        let (read_half, write_half) = stream.into_split();
        info!("Connected to backend socket {}", socket_path.display());
        Ok(Self::open(read_half, write_half, registry))
    }

    /// Connect with automatic retry and exponential backoff.
    ///
    /// Useful when the backend may still be starting up.
    /// Retries with delays of 100ms, 200ms, 400ms, etc.
    #[cfg(unix)]
    pub async fn connect_unix_with_retry(
        socket_path: &std::path::Path,
        registry: Arc<HandlerRegistry>,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        let mut last_error = ClientError::Config("max_attempts must be > 0".to_string());

        for attempt in 1..=max_attempts {
            match Self::connect_unix(socket_path, Arc::clone(&registry)).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    debug!("Connect attempt {} failed: {}", attempt, e);
                    last_error = e;
                    if attempt < max_attempts {
                        let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(10)));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Write a request and return a handle to await its reply.
    pub async fn start_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<PendingReply, ClientError> {
        let (id, rx) = self.tracker.register()?;
        debug!("Request {} -> {}", id, method);

        if let Err(e) = self
            .outbound
            .send(&Message::request(id, method, params))
            .await
        {
            self.tracker.forget(id);
            return Err(e);
        }
        Ok(PendingReply { id, rx })
    }

    /// Send a request and wait for its reply.
    ///
    /// A backend error object comes back as `Ok(Err(RpcError))`; only local
    /// failures are `Err`.
    pub async fn request(&self, method: &str, params: Value) -> Result<Reply, ClientError> {
        self.start_request(method, params).await?.wait().await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Reply, ClientError> {
        self.start_request(method, params)
            .await?
            .wait_timeout(limit)
            .await
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ClientError> {
        if let Some(reason) = self.closed_reason() {
            return Err(ClientError::TransportClosed(reason));
        }
        debug!("Notify -> {}", method);
        self.outbound
            .send(&Message::notification(method, params))
            .await
    }

    /// Ask the backend to abandon request `id`.
    ///
    /// Cancellation is cooperative: the request stays pending until the
    /// backend answers it, typically with an error.
    pub async fn cancel_request(&self, id: RequestId) -> Result<(), ClientError> {
        self.notify(CANCEL_REQUEST_METHOD, json!({ "id": id })).await
    }

    /// Fail every pending request and refuse new ones.
    pub fn close(&self, reason: &str) -> usize {
        self.tracker.fail_all(reason)
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.closed_rx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    /// Resolve once the inbound stream has ended; returns the reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "reader task stopped".to_string(),
        };
        reason
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.tracker.fail_all("connection dropped");
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut framer: Framer,
    dispatcher: Dispatcher,
    tracker: Arc<RequestTracker>,
    stats: Arc<ConnectionStats>,
    closed_tx: watch::Sender<Option<String>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "channel closed by backend".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read error: {}", e),
        };

        for frame in framer.feed(&buf[..n]) {
            stats.frames.fetch_add(1, Ordering::Relaxed);
            match decode(&frame) {
                Ok(message) => dispatcher.on_message(message),
                Err(e) => {
                    stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping undecodable frame: {}", e);
                }
            }
        }
        stats.resyncs.store(framer.resyncs(), Ordering::Relaxed);
    };

    if framer.buffered() > 0 {
        debug!(
            "Discarding {} bytes of incomplete frame at close",
            framer.buffered()
        );
    }

    let failed = tracker.fail_all(&reason);
    info!("Connection closed ({}); failed {} pending requests", reason, failed);
    let _ = closed_tx.send(Some(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::codec::{encode, RpcError};
    use crate::ipc::framing::Frame;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// In-memory stand-in for the backend end of the channel.
    struct FakeBackend {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        framer: Framer,
        queued: Vec<Frame>,
    }

    impl FakeBackend {
        async fn next_message(&mut self) -> Message {
            let mut buf = [0u8; 4096];
            while self.queued.is_empty() {
                let n = timeout(TEST_TIMEOUT, self.reader.read(&mut buf))
                    .await
                    .expect("Test timed out")
                    .expect("Read failed");
                assert!(n > 0, "client closed the channel");
                self.queued.extend(self.framer.feed(&buf[..n]));
            }
            decode(&self.queued.remove(0)).expect("client sent undecodable frame")
        }

        async fn write_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn send(&mut self, message: &Message) {
            let wire = encode(message).unwrap();
            self.write_raw(&wire).await;
        }
    }

    fn pair() -> (Connection, FakeBackend, Arc<HandlerRegistry>) {
        let (client, backend) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);
        let registry = Arc::new(HandlerRegistry::new());
        let connection = Connection::open(client_read, client_write, Arc::clone(&registry));
        let backend = FakeBackend {
            reader: backend_read,
            writer: backend_write,
            framer: Framer::new(),
            queued: Vec::new(),
        };
        (connection, backend, registry)
    }

    fn ping_pong_stream() -> Vec<u8> {
        let mut stream = encode(&Message::request(1, "ping", Value::Null))
            .unwrap()
            .to_vec();
        stream.extend_from_slice(&encode(&Message::response(1, Ok(json!("pong")))).unwrap());
        stream
    }

    fn decode_chunks<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> Vec<Message> {
        let mut framer = Framer::new();
        chunks
            .flat_map(|chunk| framer.feed(chunk))
            .map(|frame| decode(&frame).unwrap())
            .collect()
    }

    #[test]
    fn test_ping_pong_single_feed_and_thirty_feeds_agree() {
        let stream = ping_pong_stream();
        let whole = decode_chunks(std::iter::once(stream.as_slice()));
        assert_eq!(
            whole,
            vec![
                Message::request(1, "ping", Value::Null),
                Message::response(1, Ok(json!("pong"))),
            ]
        );

        let len = stream.len();
        let chunks: Vec<&[u8]> = (0..30)
            .map(|i| &stream[i * len / 30..(i + 1) * len / 30])
            .collect();
        assert_eq!(chunks.len(), 30);
        assert_eq!(decode_chunks(chunks.into_iter()), whole);
    }

    #[tokio::test]
    async fn test_ping_pong_in_one_buffer_resolves_request() {
        let (connection, mut backend, _registry) = pair();

        let pending = connection.start_request("ping", Value::Null).await.unwrap();
        assert_eq!(pending.id(), 1);
        assert_eq!(
            backend.next_message().await,
            Message::request(1, "ping", Value::Null)
        );

        backend.write_raw(&ping_pong_stream()).await;

        let reply = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap().unwrap();
        assert_eq!(reply, Ok(json!("pong")));

        // The backend's own `ping` request had no handler.
        assert_eq!(
            backend.next_message().await,
            Message::response(1, Err(RpcError::method_not_found("ping")))
        );
        assert_eq!(connection.stats().frames, 2);
    }

    #[tokio::test]
    async fn test_byte_by_byte_delivery_resolves_request() {
        let (connection, mut backend, _registry) = pair();
        let pending = connection.start_request("ping", Value::Null).await.unwrap();
        backend.next_message().await;

        for byte in ping_pong_stream() {
            backend.write_raw(&[byte]).await;
            tokio::task::yield_now().await;
        }

        let reply = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap().unwrap();
        assert_eq!(reply, Ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolved_in_reverse() {
        let (connection, mut backend, _registry) = pair();
        let connection = Arc::new(connection);

        let mut tasks = Vec::new();
        for n in 0..8 {
            let connection = Arc::clone(&connection);
            tasks.push(tokio::spawn(async move {
                connection
                    .request("task/status", json!({ "n": n }))
                    .await
                    .map(|reply| (n, reply))
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..8 {
            match backend.next_message().await {
                Message::Request { id, params, .. } => requests.push((id, params)),
                other => panic!("Expected request, got: {:?}", other),
            }
        }
        for (id, params) in requests.iter().rev() {
            backend
                .send(&Message::response(*id, Ok(json!({ "echo": params["n"] }))))
                .await;
        }

        for task in tasks {
            let (n, reply) = timeout(TEST_TIMEOUT, task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(reply, Ok(json!({ "echo": n })));
        }
    }

    #[tokio::test]
    async fn test_backend_error_is_a_normal_outcome() {
        let (connection, mut backend, _registry) = pair();
        let pending = connection
            .start_request("task/execute", json!({"task": "x"}))
            .await
            .unwrap();
        let id = backend.next_message().await.id().unwrap();
        backend
            .send(&Message::response(id, Err(RpcError::new(-32000, "busy"))))
            .await;

        let reply = pending.wait().await.expect("not a transport failure");
        assert_eq!(reply, Err(RpcError::new(-32000, "busy")));
    }

    #[tokio::test]
    async fn test_garbage_is_absorbed() {
        let (connection, mut backend, _registry) = pair();
        let pending = connection.start_request("ping", Value::Null).await.unwrap();
        backend.next_message().await;

        backend.write_raw(b"Traceback (most recent call last):\r\n\r\n").await;
        backend.write_raw(b"Content-Length: 9\r\n\r\nnot json!").await;
        backend.send(&Message::response(99, Ok(Value::Null))).await;
        backend.send(&Message::response(1, Ok(json!("pong")))).await;

        let reply = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap().unwrap();
        assert_eq!(reply, Ok(json!("pong")));

        let stats = connection.stats();
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.unmatched_responses, 1);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_channel_close_fails_pending_requests() {
        let (connection, mut backend, _registry) = pair();
        let first = connection.start_request("a", Value::Null).await.unwrap();
        let second = connection.start_request("b", Value::Null).await.unwrap();
        backend.next_message().await;
        backend.next_message().await;

        drop(backend);

        for pending in [first, second] {
            let result = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap();
            assert!(matches!(result, Err(ClientError::TransportClosed(_))));
        }
        let reason = timeout(TEST_TIMEOUT, connection.closed()).await.unwrap();
        assert_eq!(reason, "channel closed by backend");

        let err = connection.request("c", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::TransportClosed(_)));
        assert!(connection.notify("d", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_leaves_late_reply_harmless() {
        let (connection, mut backend, _registry) = pair();
        let result = connection
            .request_with_timeout("slow", Value::Null, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));

        let id = backend.next_message().await.id().unwrap();
        backend.send(&Message::response(id, Ok(json!("late")))).await;

        // A later exchange still works and the late reply was matched, not
        // counted as unknown.
        let pending = connection.start_request("fast", Value::Null).await.unwrap();
        let fast_id = backend.next_message().await.id().unwrap();
        backend.send(&Message::response(fast_id, Ok(json!(1)))).await;
        assert_eq!(pending.wait().await.unwrap(), Ok(json!(1)));
        assert_eq!(connection.stats().unmatched_responses, 0);
        assert_eq!(connection.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_request_sends_notification() {
        let (connection, mut backend, _registry) = pair();
        let pending = connection.start_request("task/execute", Value::Null).await.unwrap();
        backend.next_message().await;

        connection.cancel_request(pending.id()).await.unwrap();
        assert_eq!(
            backend.next_message().await,
            Message::notification(CANCEL_REQUEST_METHOD, json!({ "id": pending.id() }))
        );
    }

    #[tokio::test]
    async fn test_notifications_reach_registered_handler() {
        let (_connection, mut backend, registry) = pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.on_notification("task/output", move |params: Value| {
            let _ = tx.send(params["text"].as_str().unwrap_or_default().to_string());
        });

        backend
            .send(&Message::notification("task/unknownEvent", json!({})))
            .await;
        backend
            .send(&Message::notification("task/output", json!({"text": "line 1"})))
            .await;
        backend
            .send(&Message::notification("task/output", json!({"text": "line 2"})))
            .await;

        let mut lines = Vec::new();
        for _ in 0..2 {
            lines.push(timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(lines, vec!["line 1", "line 2"]);
    }
}
