//! JSON-RPC transport to the agent backend.
//!
//! # Architecture
//!
//! ```text
//!  backend stdout / socket                               callers
//!  ──────────────────────►┌────────┐  Frame  ┌───────┐  Message  ┌────────────┐
//!                         │ Framer │────────►│ codec │──────────►│ Dispatcher │──► tracker / handlers
//!                         └────────┘         └───────┘           └────────────┘
//!  backend stdin / socket ◄────────── Outbound (serialized) ◄──────────── request / notify
//! ```
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 46\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"task/status"}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use agentlink::ipc::{Connection, HandlerRegistry};
//! use serde_json::json;
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! let conn = Connection::connect_unix(path, registry).await?;
//! let reply = conn.request("task/status", json!({"taskId": "t-1"})).await?;
//! ```

mod codec;
mod connection;
mod dispatch;
mod framing;
mod outbound;
mod tracker;

pub use codec::{
    decode, encode, CodecError, DecodeError, DecodeErrorKind, Message, Reply, RequestId, RpcError,
};
pub use connection::{
    Connection, ConnectionStats, PendingReply, StatsSnapshot, CANCEL_REQUEST_METHOD,
};
pub use dispatch::{Dispatcher, HandlerRegistry, NotificationHandler, RequestHandler};
pub use framing::{
    frame_body, write_frame, Frame, Framer, FramingError, DEFAULT_MAX_MESSAGE_SIZE, MAX_HEADER_SIZE,
};
pub use outbound::Outbound;
pub use tracker::{Completion, CompletionSender, RequestTracker};
