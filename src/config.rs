//! Client configuration.
//!
//! Loaded from JSON (default `~/.config/agentlink/config.json` on Linux,
//! `~/Library/Application Support/agentlink/config.json` on macOS). Every
//! field is optional in the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ClientError;
use crate::ipc::DEFAULT_MAX_MESSAGE_SIZE;

/// Environment variable overriding the backend command.
pub const BACKEND_ENV: &str = "AGENTLINK_BACKEND";
/// Environment variable overriding the backend working directory.
pub const CWD_ENV: &str = "AGENTLINK_CWD";

pub const DEFAULT_COMMAND: &str = "agent-backend";
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// What to do when the backend exits unexpectedly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnCrash {
        max_restarts: u32,
        #[serde(default = "default_backoff_ms")]
        backoff_ms: u64,
    },
}

fn default_backoff_ms() -> u64 {
    500
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based), or `None` once the
    /// policy is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RestartPolicy::Never => None,
            RestartPolicy::OnCrash {
                max_restarts,
                backoff_ms,
            } => {
                if attempt == 0 || attempt > max_restarts {
                    return None;
                }
                let factor = 1u64 << (attempt - 1).min(16);
                Some(Duration::from_millis(backoff_ms.saturating_mul(factor)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend executable (path or bare command looked up on `PATH`).
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the backend process.
    pub env: BTreeMap<String, String>,
    pub handshake_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Timeout applied by `Supervisor::request` when set. Requests wait
    /// indefinitely otherwise.
    pub request_timeout_ms: Option<u64>,
    pub max_message_size: usize,
    pub restart: RestartPolicy,
    pub client_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            request_timeout_ms: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            restart: RestartPolicy::Never,
            client_name: "agentlink".to_string(),
        }
    }
}

impl ClientConfig {
    /// Config for spawning `command` with defaults for everything else.
    pub fn for_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Default config file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("agentlink").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            ClientError::Config(format!("Invalid config {}: {}", path.display(), e))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else
    /// defaults. Environment overrides are applied last.
    pub fn discover(path: Option<&Path>) -> Result<Self, ClientError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => Self::load(&default)?,
                None => Self::default(),
            },
        };
        Ok(config.with_overrides(
            std::env::var(BACKEND_ENV).ok(),
            std::env::var(CWD_ENV).ok(),
        ))
    }

    /// Apply backend/working-directory overrides (environment or CLI).
    pub fn with_overrides(mut self, backend: Option<String>, cwd: Option<String>) -> Self {
        if let Some(backend) = backend.filter(|b| !b.is_empty()) {
            info!("Using backend command override: {}", backend);
            self.command = backend;
        }
        if let Some(cwd) = cwd.filter(|c| !c.is_empty()) {
            self.working_dir = Some(PathBuf::from(cwd));
        }
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.command.trim().is_empty() {
            return Err(ClientError::Config("command must not be empty".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ClientError::Config(
                "handshake_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ClientError::Config(
                "max_message_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the command to execute.
    ///
    /// Paths are used as given. A bare name is looked up next to the current
    /// executable first, then left for `PATH` lookup.
    pub fn resolve_command(&self) -> PathBuf {
        let command = Path::new(&self.command);
        if command.components().count() > 1 || command.is_absolute() {
            return command.to_path_buf();
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let sibling = exe_dir.join(command);
                if sibling.is_file() {
                    info!("Using backend next to executable: {}", sibling.display());
                    return sibling;
                }
            }
        }

        command.to_path_buf()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}
