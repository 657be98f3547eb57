//! Backend process lifecycle.
//!
//! The supervisor spawns the backend with piped stdio, runs the `initialize`
//! handshake, and watches the child for exit. Stdout feeds a [`Connection`];
//! stderr is free text and only ever logged.
//!
//! ```text
//! Stopped ──start──► Starting ──handshake ok──► Running ──shutdown──► Stopping ──► Stopped
//!                        │                         │
//!                  handshake failed             crashed
//!                        ▼                         ▼
//!                     Stopped                   Crashed ──► Stopped (──► restart?)
//! ```

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, RestartPolicy};
use crate::error::ClientError;
use crate::ipc::{CodecError, Connection, HandlerRegistry, PendingReply, Reply, RequestId, RpcError};
use crate::logging::forward_backend_log;
use crate::protocol::{
    self, CompleteParams, ExecuteParams, ExecuteResult, InitializeParams, InitializeResult,
    OutputParams, ProgressParams, TaskRef, TaskStatus,
};

/// Bound on waiting for a killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to exit observers every time a backend process ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitEvent {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// False only for exits this client asked for.
    pub unexpected: bool,
    pub at: DateTime<Utc>,
}

type ExitObserver = Arc<dyn Fn(&ExitEvent) + Send + Sync>;

/// One spawned backend process and its connection.
struct Session {
    generation: u64,
    pid: Option<u32>,
    connection: Arc<Connection>,
    expected_exit: Arc<AtomicBool>,
    /// Dropping this (with the session) kills the child.
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<Option<i32>>>,
}

impl Session {
    fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait up to `limit` for the child to exit. `Some(code)` once it has.
    async fn wait_exit(&self, limit: Duration) -> Option<Option<i32>> {
        let mut rx = self.exited.clone();
        let exit = match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => Some((*exit).flatten()),
            Ok(Err(_)) => Some(None),
            Err(_) => None,
        };
        exit
    }
}

struct Inner {
    config: ClientConfig,
    registry: Arc<HandlerRegistry>,
    state_tx: watch::Sender<ProcessState>,
    /// Lifecycle lock. Held across start, shutdown and crash handling.
    session: Mutex<Option<Session>>,
    /// Connection of the running session, for request traffic.
    current: RwLock<Option<Arc<Connection>>>,
    capabilities: RwLock<Option<InitializeResult>>,
    observers: RwLock<Vec<ExitObserver>>,
    generation: AtomicU64,
    restarts: AtomicU32,
    /// Bumped by every explicit shutdown. A pending restart only fires if
    /// the epoch it was scheduled under is still current.
    stop_epoch: AtomicU64,
}

/// Owns one backend process at a time.
///
/// Cloning yields another handle to the same backend. The child is killed
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_registry(config, Arc::new(HandlerRegistry::new()))
    }

    /// Use an existing handler registry. Handlers registered on it survive
    /// backend restarts.
    pub fn with_registry(config: ClientConfig, registry: Arc<HandlerRegistry>) -> Self {
        if registry.notification_handler(protocol::LOG_MESSAGE).is_none() {
            registry.on_notification(protocol::LOG_MESSAGE, forward_backend_log);
        }
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                state_tx,
                session: Mutex::new(None),
                current: RwLock::new(None),
                capabilities: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
                restarts: AtomicU32::new(0),
                stop_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.inner.state_tx.subscribe()
    }

    /// Capabilities reported by the running backend's handshake.
    ///
    /// `None` whenever no backend is running.
    pub fn capabilities(&self) -> Option<InitializeResult> {
        read_lock(&self.inner.capabilities).clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.session.lock().await.as_ref().and_then(|s| s.pid)
    }

    /// Register an observer called on every backend exit.
    pub fn on_exit<F>(&self, observer: F)
    where
        F: Fn(&ExitEvent) + Send + Sync + 'static,
    {
        write_lock(&self.inner.observers).push(Arc::new(observer));
    }

    /// Register a typed handler for a backend notification.
    ///
    /// Notifications whose params don't match `T` are logged and skipped.
    pub fn on_notification<T, F>(&self, method: &str, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = method.to_string();
        self.inner
            .registry
            .on_notification(method, move |params: Value| {
                match serde_json::from_value::<T>(params) {
                    Ok(typed) => handler(typed),
                    Err(e) => debug!("Skipping malformed {} notification: {}", name, e),
                }
            });
    }

    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(ProgressParams) + Send + Sync + 'static,
    {
        self.on_notification(protocol::TASK_PROGRESS, handler);
    }

    pub fn on_output<F>(&self, handler: F)
    where
        F: Fn(OutputParams) + Send + Sync + 'static,
    {
        self.on_notification(protocol::TASK_OUTPUT, handler);
    }

    pub fn on_complete<F>(&self, handler: F)
    where
        F: Fn(CompleteParams) + Send + Sync + 'static,
    {
        self.on_notification(protocol::TASK_COMPLETE, handler);
    }

    /// Spawn the backend and complete the handshake.
    ///
    /// Returns the backend's capabilities. Calling `start` while already
    /// running returns the stored capabilities without respawning.
    pub async fn start(&self) -> Result<InitializeResult, ClientError> {
        let mut session = self.inner.session.lock().await;
        self.inner.restarts.store(0, Ordering::SeqCst);
        self.inner.start_locked(&mut session).await
    }

    /// Gracefully stop the backend: `shutdown`, `exit`, wait, then kill.
    ///
    /// Also cancels a restart that is waiting out its backoff after a crash.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let mut guard = self.inner.session.lock().await;
        self.inner.stop_epoch.fetch_add(1, Ordering::SeqCst);
        let Some(mut session) = guard.take() else {
            debug!("Shutdown requested but backend is not running");
            return Ok(());
        };

        self.inner.set_state(ProcessState::Stopping);
        session.expected_exit.store(true, Ordering::SeqCst);
        self.inner.set_connection(None);
        *write_lock(&self.inner.capabilities) = None;

        let limit = self.inner.config.shutdown_timeout();
        match session
            .connection
            .request_with_timeout(protocol::SHUTDOWN, Value::Null, limit)
            .await
        {
            Ok(Ok(_)) => debug!("Backend acknowledged shutdown"),
            Ok(Err(e)) => warn!("Backend rejected shutdown: {}", e),
            Err(e) => warn!("Shutdown request failed: {}", e),
        }
        if let Err(e) = session
            .connection
            .notify(protocol::EXIT, Value::Null)
            .await
        {
            debug!("Could not send exit notification: {}", e);
        }

        if session.wait_exit(limit).await.is_none() {
            warn!("Backend didn't exit gracefully, killing");
            session.kill();
            if session.wait_exit(KILL_GRACE).await.is_none() {
                warn!("Backend (pid {:?}) did not die after kill", session.pid);
            }
        }

        session.connection.close("backend shut down");
        self.inner.set_state(ProcessState::Stopped);
        info!("Backend stopped");
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        let state = self.state();
        if state != ProcessState::Running {
            return Err(ClientError::NotRunning(state));
        }
        read_lock(&self.inner.current)
            .clone()
            .ok_or(ClientError::NotRunning(state))
    }

    /// Send a request to the running backend.
    ///
    /// Bounded by `request_timeout_ms` when the config sets one.
    pub async fn request(&self, method: &str, params: Value) -> Result<Reply, ClientError> {
        let connection = self.connection()?;
        match self.inner.config.request_timeout() {
            Some(limit) => connection.request_with_timeout(method, params, limit).await,
            None => connection.request(method, params).await,
        }
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Reply, ClientError> {
        self.connection()?
            .request_with_timeout(method, params, limit)
            .await
    }

    /// Write a request and return its handle without waiting.
    pub async fn start_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<PendingReply, ClientError> {
        self.connection()?.start_request(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ClientError> {
        self.connection()?.notify(method, params).await
    }

    /// Send `$/cancelRequest` for an in-flight request.
    pub async fn cancel_request(&self, id: RequestId) -> Result<(), ClientError> {
        self.connection()?.cancel_request(id).await
    }

    /// Typed request: serialize `params`, deserialize a successful result.
    pub async fn call<P, R>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<Result<R, RpcError>, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(CodecError::from)?;
        match self.request(method, params).await? {
            Ok(value) => serde_json::from_value(value).map(Ok).map_err(|source| {
                ClientError::Codec(CodecError::ResultShape {
                    method: method.to_string(),
                    source,
                })
            }),
            Err(e) => Ok(Err(e)),
        }
    }

    pub async fn execute(
        &self,
        params: &ExecuteParams,
    ) -> Result<Result<ExecuteResult, RpcError>, ClientError> {
        self.call(protocol::TASK_EXECUTE, params).await
    }

    pub async fn status(&self, task_id: &str) -> Result<Result<TaskStatus, RpcError>, ClientError> {
        self.call(protocol::TASK_STATUS, &TaskRef::new(task_id))
            .await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Result<Value, RpcError>, ClientError> {
        self.call(protocol::TASK_CANCEL, &TaskRef::new(task_id))
            .await
    }
}

impl Inner {
    fn set_state(&self, state: ProcessState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Backend state {} -> {}", previous, state);
        }
    }

    fn set_connection(&self, connection: Option<Arc<Connection>>) {
        *write_lock(&self.current) = connection;
    }

    fn notify_exit(&self, event: &ExitEvent) {
        let observers: Vec<ExitObserver> = read_lock(&self.observers).clone();
        for observer in observers {
            observer(event);
        }
    }

    async fn start_locked(
        self: &Arc<Self>,
        session: &mut Option<Session>,
    ) -> Result<InitializeResult, ClientError> {
        if session.is_some() {
            if let Some(capabilities) = read_lock(&self.capabilities).clone() {
                return Ok(capabilities);
            }
        }
        self.config.validate()?;
        self.set_state(ProcessState::Starting);

        let program = self.config.resolve_command();
        let mut command = Command::new(&program);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(ProcessState::Stopped);
                return Err(ClientError::Spawn(e));
            }
        };
        let pid = child.id();
        info!("Spawned backend {} (pid {:?})", program.display(), pid);

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            self.set_state(ProcessState::Stopped);
            return Err(ClientError::Spawn(std::io::Error::other(
                "backend stdio was not piped",
            )));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        let connection = Arc::new(Connection::open_with_limit(
            stdout,
            stdin,
            Arc::clone(&self.registry),
            self.config.max_message_size,
        ));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let expected_exit = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(monitor(
            Arc::downgrade(self),
            child,
            kill_rx,
            exit_tx,
            generation,
            Arc::clone(&expected_exit),
            Arc::clone(&connection),
        ));

        let mut new_session = Session {
            generation,
            pid,
            connection: Arc::clone(&connection),
            expected_exit,
            kill_tx: Some(kill_tx),
            exited: exit_rx,
        };

        match self.handshake(&connection).await {
            Ok(result) => {
                *write_lock(&self.capabilities) = Some(result.clone());
                self.set_connection(Some(connection));
                *session = Some(new_session);
                self.set_state(ProcessState::Running);
                info!("Backend running (pid {:?})", pid);
                Ok(result)
            }
            Err(reason) => {
                warn!("Handshake failed: {}", reason);
                new_session.expected_exit.store(true, Ordering::SeqCst);
                new_session.kill();
                if new_session.wait_exit(KILL_GRACE).await.is_none() {
                    warn!("Backend (pid {:?}) did not die after kill", pid);
                }
                new_session.connection.close("handshake failed");
                self.set_state(ProcessState::Stopped);
                Err(ClientError::Handshake(reason))
            }
        }
    }

    /// `initialize` then `initialized`. Any failure is reported as text.
    async fn handshake(&self, connection: &Connection) -> Result<InitializeResult, String> {
        let working_dir = self
            .config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok());
        let params = InitializeParams::new(&self.config.client_name, working_dir.as_deref());
        let params = serde_json::to_value(params).map_err(|e| e.to_string())?;

        let limit = self.config.handshake_timeout();
        let result = match connection
            .request_with_timeout(protocol::INITIALIZE, params, limit)
            .await
        {
            Ok(Ok(Value::Null)) => InitializeResult::default(),
            Ok(Ok(value)) => serde_json::from_value(value)
                .map_err(|e| format!("invalid initialize result: {}", e))?,
            Ok(Err(e)) => return Err(format!("backend rejected initialize: {}", e)),
            Err(ClientError::Timeout(d)) => {
                return Err(format!("no initialize response within {:?}", d))
            }
            Err(e) => return Err(e.to_string()),
        };

        connection
            .notify(protocol::INITIALIZED, json!({}))
            .await
            .map_err(|e| e.to_string())?;
        Ok(result)
    }

    async fn handle_exit(
        self: Arc<Self>,
        generation: u64,
        code: Option<i32>,
        expected: bool,
        connection: Arc<Connection>,
    ) {
        let reason = describe_exit(code);
        let failed = connection.close(&reason);
        let event = ExitEvent {
            code,
            unexpected: !expected,
            at: Utc::now(),
        };

        if expected {
            info!("Backend exited ({})", reason);
            self.notify_exit(&event);
            return;
        }

        let mut session = self.session.lock().await;
        let is_current = session.as_ref().map(|s| s.generation) == Some(generation);
        if !is_current || *self.state_tx.borrow() != ProcessState::Running {
            // Start or shutdown already tore this process down.
            drop(session);
            warn!("Backend exited unexpectedly ({})", reason);
            self.notify_exit(&event);
            return;
        }

        warn!(
            "Backend crashed ({}); failed {} pending requests",
            reason, failed
        );
        self.set_state(ProcessState::Crashed);
        *session = None;
        self.set_connection(None);
        *write_lock(&self.capabilities) = None;
        self.notify_exit(&event);
        self.set_state(ProcessState::Stopped);
        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        drop(session);

        self.schedule_restart(epoch);
    }

    /// Queue the next restart attempt. `epoch` is the stop epoch observed
    /// under the lifecycle lock when the crash was handled.
    fn schedule_restart(self: &Arc<Self>, epoch: u64) {
        let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(delay) = self.config.restart.delay_for(attempt) else {
            if let RestartPolicy::OnCrash { max_restarts, .. } = self.config.restart {
                warn!("Giving up after {} restart attempts", max_restarts);
            }
            return;
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut session = inner.session.lock().await;
            if inner.stop_epoch.load(Ordering::SeqCst) != epoch {
                debug!("Skipping restart; backend was shut down");
                return;
            }
            if session.is_some() || *inner.state_tx.borrow() != ProcessState::Stopped {
                debug!("Skipping restart; backend was started elsewhere");
                return;
            }
            info!("Restarting backend (attempt {})", attempt);
            if let Err(e) = inner.start_locked(&mut session).await {
                warn!("Restart attempt {} failed: {}", attempt, e);
                drop(session);
                inner.schedule_restart(epoch);
            }
        });
    }
}

async fn monitor(
    inner: Weak<Inner>,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    generation: u64,
    expected_exit: Arc<AtomicBool>,
    connection: Arc<Connection>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!("Kill failed: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Error waiting for backend: {}", e);
            None
        }
    };
    exit_tx.send_replace(Some(code));

    match inner.upgrade() {
        Some(inner) => {
            inner
                .handle_exit(
                    generation,
                    code,
                    expected_exit.load(Ordering::SeqCst),
                    connection,
                )
                .await
        }
        None => {
            connection.close(&describe_exit(code));
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    info!(target: "agentlink::backend", "stderr: {}", text);
                }
            }
            Err(e) => {
                debug!("Backend stderr closed: {}", e);
                break;
            }
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("backend exited with code {}", code),
        None => "backend terminated by signal".to_string(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
