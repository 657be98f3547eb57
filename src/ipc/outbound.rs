//! Serialized writer for outgoing frames.

use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::trace;

use super::codec::{encode, Message};
use super::framing::write_frame;
use crate::error::ClientError;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Single writer shared by every caller of a connection.
///
/// Each message is encoded outside the lock, then written and flushed while
/// holding it, so concurrent senders never interleave their bytes.
pub struct Outbound {
    writer: Mutex<BoxedWriter>,
}

impl Outbound {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let wire = encode(message)?;
        trace!("Sending {} bytes: {:?}", wire.len(), message);

        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &wire)
            .await
            .map_err(ClientError::Io)
    }
}
