//! Content-Length message framing for JSON-RPC over byte streams.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). Unlike a blocking line reader,
//! the [`Framer`] is push-based: bytes are fed in whatever chunks the transport
//! delivers and complete frames come out.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header names are case-insensitive and extra headers (e.g. `Content-Type`)
//! are ignored.
//!
//! # Resynchronization
//!
//! A header block without a usable `Content-Length` is dropped together with
//! its terminator and scanning continues with the following bytes. Text that
//! precedes a `Content-Length` header inside the same block is skipped, so a
//! backend that leaks diagnostics onto stdout recovers at its next header.
//! Unterminated text is capped at [`MAX_HEADER_SIZE`]: past that, everything
//! but the trailing partial line is dropped.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Maximum message size (100MB) to prevent OOM from malicious/buggy backends.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Most bytes held while waiting for a header terminator.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Longest header excerpt included in a resync diagnostic.
const HEADER_PREVIEW_LEN: usize = 80;

/// One complete message body carved out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Frame(body.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

/// Why a header block was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Missing Content-Length header")]
    MissingLength,

    #[error("Invalid Content-Length value: {0}")]
    InvalidLength(String),

    #[error("Content-Length is zero")]
    EmptyBody,

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },
}

/// Push-based frame reassembler.
///
/// The buffer always holds exactly the bytes not yet turned into frames.
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    /// Offset up to which the buffer is known not to start a terminator.
    scanned: usize,
    max_message_size: usize,
    resyncs: u64,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            scanned: 0,
            max_message_size,
            resyncs: 0,
        }
    }

    /// Append `bytes` and return every frame that is now complete, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        if !bytes.is_empty() {
            self.buffer.extend_from_slice(bytes);
        }

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Number of header blocks discarded while resynchronizing.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(header_end) = find_terminator(&self.buffer, self.scanned) else {
                if self.buffer.len() > MAX_HEADER_SIZE {
                    self.discard_unterminated();
                }
                // Keep the last few bytes in the rescan window: they may be the
                // start of a terminator split across feeds.
                self.scanned = self
                    .buffer
                    .len()
                    .saturating_sub(HEADER_TERMINATOR.len() - 1);
                return None;
            };
            let body_start = header_end + HEADER_TERMINATOR.len();

            match parse_content_length(&self.buffer[..header_end], self.max_message_size) {
                Ok(size) => {
                    if self.buffer.len() - body_start < size {
                        self.scanned = header_end;
                        return None;
                    }
                    self.buffer.advance(body_start);
                    let body = self.buffer.split_to(size).freeze();
                    self.scanned = 0;
                    return Some(Frame(body));
                }
                Err(e) => {
                    let preview = String::from_utf8_lossy(&self.buffer[..header_end]);
                    warn!(
                        "Discarding malformed header block ({}): {:?}",
                        e,
                        truncate(&preview, HEADER_PREVIEW_LEN)
                    );
                    self.resyncs += 1;
                    self.buffer.advance(body_start);
                    self.scanned = 0;
                }
            }
        }
    }
}

impl Framer {
    /// Drop buffered text that never reached a header terminator.
    ///
    /// The last line is kept when it is short enough to still become a
    /// header; otherwise only a possible terminator prefix survives.
    fn discard_unterminated(&mut self) {
        let tail_start = self.buffer.len() - (HEADER_TERMINATOR.len() - 1);
        let mut cut = self.buffer[..tail_start]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(tail_start, |pos| pos + 1);
        if self.buffer.len() - cut > MAX_HEADER_SIZE {
            cut = tail_start;
        }

        let preview = String::from_utf8_lossy(&self.buffer[..cut]);
        warn!(
            "Discarding {} bytes without a header terminator: {:?}",
            cut,
            truncate(&preview, HEADER_PREVIEW_LEN)
        );
        self.resyncs += 1;
        self.buffer.advance(cut);
    }
}

fn find_terminator(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < from + HEADER_TERMINATOR.len() {
        return None;
    }
    buffer[from..]
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + from)
}

/// Extract the body length from a header block (terminator excluded).
///
/// The last `Content-Length` line wins; anything before the header name on
/// that line is ignored.
fn parse_content_length(block: &[u8], max: usize) -> Result<usize, FramingError> {
    let text = String::from_utf8_lossy(block);
    let mut content_length: Option<Result<usize, FramingError>> = None;

    for line in text.split(|c: char| c == '\r' || c == '\n') {
        if let Some(value) = content_length_value(line) {
            content_length = Some(
                value
                    .parse::<usize>()
                    .map_err(|_| FramingError::InvalidLength(value.to_string())),
            );
        }
    }

    match content_length {
        None => Err(FramingError::MissingLength),
        Some(Err(e)) => Err(e),
        Some(Ok(0)) => Err(FramingError::EmptyBody),
        Some(Ok(size)) if size > max => Err(FramingError::TooLarge { size, max }),
        Some(Ok(size)) => Ok(size),
    }
}

/// Value of a `Content-Length` header on `line`, if the line carries one.
fn content_length_value(line: &str) -> Option<&str> {
    // ASCII lowercasing keeps byte offsets aligned with `line`.
    let lower = line.to_ascii_lowercase();
    let name_end = lower.rfind(CONTENT_LENGTH)? + CONTENT_LENGTH.len();
    let rest = line[name_end..].trim_start().strip_prefix(':')?;
    Some(rest.trim())
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Wrap a serialized body in its Content-Length header.
///
/// The length is the body's byte count, so multi-byte text is framed correctly.
pub fn frame_body(body: &[u8]) -> Bytes {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut wire = BytesMut::with_capacity(header.len() + body.len());
    wire.extend_from_slice(header.as_bytes());
    wire.extend_from_slice(body);
    wire.freeze()
}

/// Write one already-framed message and flush it.
///
/// Callers must hold the connection's writer lock so frames never interleave.
pub async fn write_frame<W>(writer: &mut W, wire: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(wire).await?;
    writer.flush().await
}
