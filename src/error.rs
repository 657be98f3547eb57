//! Error types for the agentlink client.
//!
//! Faults on the inbound byte stream (bad headers, undecodable frames,
//! unmatched responses) never show up here: the connection absorbs them and
//! only logs. `ClientError` covers what a caller can actually observe.

use std::time::Duration;

use thiserror::Error;

use crate::ipc::CodecError;
use crate::supervisor::ProcessState;

/// Client-visible error types.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend process could not be spawned.
    #[error("Failed to spawn backend: {0}")]
    Spawn(#[source] std::io::Error),

    /// Failed to connect to a backend socket.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// I/O error while writing to the backend.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// An outgoing message could not be encoded.
    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),

    /// The channel closed or the backend exited while the request was pending.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The initialize handshake failed; the backend never reached `Running`.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Traffic was attempted while the backend was not running.
    #[error("Backend is not running (state: {0})")]
    NotRunning(ProcessState),

    /// A caller-imposed timeout elapsed before the response arrived.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// True for failures caused locally by the channel going away, as
    /// opposed to anything the backend said.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ClientError::TransportClosed(_) | ClientError::Io(_))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionFailed(err)
            }
            _ => ClientError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        let timeout_err = ClientError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout_err.to_string(), "Request timed out after 30s");

        let closed = ClientError::TransportClosed("backend exited with code 1".to_string());
        assert_eq!(
            closed.to_string(),
            "Transport closed: backend exited with code 1"
        );

        let not_running = ClientError::NotRunning(ProcessState::Stopped);
        assert_eq!(
            not_running.to_string(),
            "Backend is not running (state: stopped)"
        );
    }

    #[test]
    fn test_client_error_from_io() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: ClientError = not_found.into();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ClientError = refused.into();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let err: ClientError = broken.into();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(err.is_transport_failure());
    }

    #[test]
    fn test_handshake_is_not_transport_failure() {
        let err = ClientError::Handshake("initialize timed out".to_string());
        assert!(!err.is_transport_failure());
    }
}
