//! agentlink: client for a long-running agent backend speaking
//! Content-Length framed JSON-RPC 2.0.
//!
//! - `ipc` - framing, codec, request tracking, dispatch, connections
//! - `supervisor` - backend process lifecycle (spawn, handshake, crash, restart)
//! - `protocol` - method names and typed payloads
//! - `config` - client configuration
//! - `logging` - tracing setup
//!
//! # Example
//!
//! ```ignore
//! use agentlink::{ClientConfig, Supervisor};
//! use agentlink::protocol::ExecuteParams;
//!
//! let supervisor = Supervisor::new(ClientConfig::discover(None)?);
//! supervisor.on_output(|out| print!("{}", out.text));
//! supervisor.start().await?;
//! let started = supervisor.execute(&ExecuteParams::new("refactor main.rs")).await??;
//! supervisor.shutdown().await?;
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod protocol;
pub mod supervisor;

pub use config::{ClientConfig, RestartPolicy};
pub use error::ClientError;
pub use supervisor::{ExitEvent, ProcessState, Supervisor};
