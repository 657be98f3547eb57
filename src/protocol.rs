//! Method catalog and payload types for the agent backend.
//!
//! Field names are camelCase on the wire. Every enum the backend can extend
//! carries an `Unknown` fallback so newer backends do not break older clients.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::ipc::RequestId;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";

pub const TASK_EXECUTE: &str = "task/execute";
pub const TASK_CANCEL: &str = "task/cancel";
pub const TASK_STATUS: &str = "task/status";

pub const TASK_PROGRESS: &str = "task/progress";
pub const TASK_OUTPUT: &str = "task/output";
pub const TASK_COMPLETE: &str = "task/complete";
pub const LOG_MESSAGE: &str = "log/message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// What this client can handle, declared during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub progress: bool,
    pub streaming_output: bool,
    pub cancellation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            progress: true,
            streaming_output: true,
            cancellation: true,
            experimental: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: u32,
    pub client_info: ClientInfo,
    pub root_uri: Option<String>,
    pub working_directory: Option<String>,
    pub capabilities: ClientCapabilities,
}

impl InitializeParams {
    /// Handshake parameters for a backend running in `working_dir`.
    pub fn new(client_name: &str, working_dir: Option<&Path>) -> Self {
        Self {
            process_id: std::process::id(),
            client_info: ClientInfo {
                name: client_name.to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            root_uri: working_dir.and_then(path_to_uri),
            working_directory: working_dir.map(|p| p.to_string_lossy().into_owned()),
            capabilities: ClientCapabilities::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Lifecycle state of a unit of work on the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Forward-compatible fallback for unknown states
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl ExecuteParams {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            working_directory: None,
            options: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub task_id: String,
    #[serde(default)]
    pub state: TaskState,
}

/// Identifies a task for `task/status` and `task/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_id: String,
}

impl TaskRef {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub task_id: String,
    /// 0.0 to 100.0 when the backend knows it.
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    #[default]
    Stdout,
    Stderr,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputParams {
    pub task_id: String,
    pub text: String,
    #[serde(default)]
    pub stream: OutputStream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteParams {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[serde(alias = "warning")]
    Warn,
    Info,
    Debug,
    Trace,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessageParams {
    pub level: LogLevel,
    pub message: String,
}

/// Payload of `$/cancelRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

/// Convert a directory path to a `file://` URI.
///
/// Relative paths are resolved against the current directory. Returns `None`
/// when the path cannot be expressed as a URI.
pub fn path_to_uri(path: &Path) -> Option<String> {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    Url::from_directory_path(&abs_path)
        .ok()
        .map(|url| url.to_string())
}
