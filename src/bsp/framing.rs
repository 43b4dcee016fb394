//! BSP message framing layer
//!
//! Reconstructs JSON-RPC message boundaries from an arbitrarily chunked byte
//! stream and re-emits every complete message as one atomic write.
//!
//! Wire format:
//! `Header-Name: value\r\n` (one per header), `\r\n`, then exactly
//! `Content-Length` payload bytes.
//!
//! The payload is never inspected. Header order is preserved so a message
//! leaves the relay with the same header block it arrived with.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{Level, trace, warn};

use crate::log_bsp_frame;

// ============================================================================
// Constants
// ============================================================================

/// Name of the mandatory length header
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Largest payload accepted before a header block is treated as invalid
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024; // 128MB

/// Default number of bytes requested from the source per read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;

/// Separator between the header block and the payload
const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

// ============================================================================
// Errors and diagnostics
// ============================================================================

/// Error types for the framing layer
///
/// Malformed frames are not errors: they are reported through a
/// [`DiagnosticSink`] and parsing continues. Only I/O on the underlying
/// streams can fail.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Non-fatal problems found while parsing a stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDiagnostic {
    #[error("Malformed header line: {line:?}")]
    MalformedHeaderLine { line: String },

    #[error("Duplicate Content-Length header ignored: {value:?}")]
    DuplicateContentLength { value: String },

    #[error("Header block without Content-Length discarded ({discarded} bytes)")]
    MissingContentLength { discarded: usize },

    #[error("Invalid Content-Length value: {value:?}")]
    InvalidContentLength { value: String },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Stream ended inside a {phase}; {discarded} buffered bytes discarded")]
    TrailingBytes { phase: FramePhase, discarded: usize },
}

/// Which part of a frame the parser was waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    HeaderBlock,
    Payload,
}

impl fmt::Display for FramePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramePhase::HeaderBlock => write!(f, "header block"),
            FramePhase::Payload => write!(f, "payload"),
        }
    }
}

/// Receiver for framing diagnostics
///
/// Injected into every [`Framer`] so that callers decide where malformed
/// input is reported. `source` names the stream the diagnostic came from.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, source: &str, diagnostic: &FrameDiagnostic);
}

/// Sink that logs every diagnostic as a warning
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, source: &str, diagnostic: &FrameDiagnostic) {
        warn!(stream = source, "{}", diagnostic);
    }
}

// ============================================================================
// Message
// ============================================================================

/// One complete protocol message
///
/// The payload length always equals the value of the single
/// `Content-Length` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Vec<(String, String)>,
    payload: Bytes,
}

impl Message {
    /// Build a message carrying only a `Content-Length` header
    #[cfg(test)]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            headers: vec![(CONTENT_LENGTH.to_string(), payload.len().to_string())],
            payload,
        }
    }

    /// Headers in their original order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup
    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of bytes this message occupies on the wire
    pub fn encoded_len(&self) -> usize {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(key, value)| key.len() + value.len() + 4)
            .sum();
        header_bytes + 2 + self.payload.len()
    }

    /// Serialize headers, blank line and payload into `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        for (key, value) in &self.headers {
            dst.put_slice(key.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        dst.put_slice(&self.payload);
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Parser state for one stream direction
#[derive(Debug, Default)]
enum ParserState {
    #[default]
    AwaitingHeaders,
    AwaitingBody {
        expected_len: usize,
        headers: Vec<(String, String)>,
    },
}

/// Incremental Content-Length codec
///
/// Decoding never fails on malformed input: offending lines or whole header
/// blocks are reported to the sink and skipped.
pub struct MessageCodec {
    /// Label used when reporting diagnostics
    source: String,

    state: ParserState,

    /// Bytes of the buffer already searched for the header delimiter
    scanned: usize,

    sink: Arc<dyn DiagnosticSink>,

    max_message_size: usize,

    /// Header blocks discarded so far
    dropped_frames: u64,
}

impl MessageCodec {
    pub fn new(source: impl Into<String>, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            source: source.into(),
            state: ParserState::default(),
            scanned: 0,
            sink,
            max_message_size: MAX_MESSAGE_SIZE,
            dropped_frames: 0,
        }
    }

    /// Override the payload size limit
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Which part of a frame the codec is waiting for
    pub fn phase(&self) -> FramePhase {
        match self.state {
            ParserState::AwaitingHeaders => FramePhase::HeaderBlock,
            ParserState::AwaitingBody { .. } => FramePhase::Payload,
        }
    }

    fn report(&self, diagnostic: FrameDiagnostic) {
        self.sink.report(&self.source, &diagnostic);
    }

    /// Position of the header delimiter, resuming where the last scan stopped
    fn find_delimiter(&mut self, buf: &[u8]) -> Option<usize> {
        let start = self.scanned.saturating_sub(HEADER_DELIMITER.len() - 1);
        match buf[start..]
            .windows(HEADER_DELIMITER.len())
            .position(|window| window == HEADER_DELIMITER)
        {
            Some(offset) => {
                self.scanned = 0;
                Some(start + offset)
            }
            None => {
                self.scanned = buf.len();
                None
            }
        }
    }

    /// Parse a header block (without the trailing delimiter)
    ///
    /// Returns the payload length and the retained headers, or `None` when
    /// the block carries no usable `Content-Length`.
    fn parse_header_block(&mut self, block: &[u8]) -> Option<(usize, Vec<(String, String)>)> {
        let mut headers = Vec::new();
        let mut content_length = None;
        let mut length_problem = None;

        for raw_line in header_lines(block) {
            if raw_line.is_empty() {
                continue;
            }

            let Some((key, value)) = std::str::from_utf8(raw_line)
                .ok()
                .and_then(|line| line.split_once(':'))
                .map(|(key, value)| (key.trim(), value.trim()))
                .filter(|(key, _)| !key.is_empty())
            else {
                self.report(FrameDiagnostic::MalformedHeaderLine {
                    line: String::from_utf8_lossy(raw_line).into_owned(),
                });
                continue;
            };

            if key.eq_ignore_ascii_case(CONTENT_LENGTH) {
                if content_length.is_some() {
                    self.report(FrameDiagnostic::DuplicateContentLength {
                        value: value.to_string(),
                    });
                    continue;
                }
                match value.parse::<usize>() {
                    Ok(size) if size > self.max_message_size => {
                        length_problem = Some(FrameDiagnostic::MessageTooLarge {
                            size,
                            max: self.max_message_size,
                        });
                        continue;
                    }
                    Ok(size) => content_length = Some(size),
                    Err(_) => {
                        length_problem = Some(FrameDiagnostic::InvalidContentLength {
                            value: value.to_string(),
                        });
                        continue;
                    }
                }
            }

            headers.push((key.to_string(), value.to_string()));
        }

        match content_length {
            Some(length) => {
                if let Some(problem) = length_problem {
                    self.report(problem);
                }
                Some((length, headers))
            }
            None => {
                self.report(length_problem.unwrap_or(FrameDiagnostic::MissingContentLength {
                    discarded: block.len() + HEADER_DELIMITER.len(),
                }));
                self.dropped_frames += 1;
                None
            }
        }
    }

    /// Drive the state machine as far as `buf` allows
    ///
    /// Consumed bytes are split off the front of `buf`; anything left over
    /// belongs to an incomplete frame.
    pub fn next_message(&mut self, buf: &mut BytesMut) -> Option<Message> {
        loop {
            match std::mem::take(&mut self.state) {
                ParserState::AwaitingHeaders => {
                    let delimiter = self.find_delimiter(buf)?;
                    let block = buf.split_to(delimiter + HEADER_DELIMITER.len());
                    if let Some((expected_len, headers)) =
                        self.parse_header_block(&block[..delimiter])
                    {
                        trace!(
                            "MessageCodec[{}]: header block parsed, awaiting {} bytes",
                            self.source, expected_len
                        );
                        self.state = ParserState::AwaitingBody {
                            expected_len,
                            headers,
                        };
                    }
                }
                ParserState::AwaitingBody {
                    expected_len,
                    headers,
                } => {
                    if buf.len() < expected_len {
                        buf.reserve(expected_len - buf.len());
                        self.state = ParserState::AwaitingBody {
                            expected_len,
                            headers,
                        };
                        return None;
                    }

                    let payload = buf.split_to(expected_len).freeze();
                    trace!(
                        "MessageCodec[{}]: parsed complete message ({} bytes)",
                        self.source, expected_len
                    );
                    return Some(Message { headers, payload });
                }
            }
        }
    }

    /// Discard whatever incomplete frame is buffered at end of stream
    ///
    /// Returns the number of discarded bytes. A non-empty remainder is
    /// reported to the sink.
    pub fn discard_incomplete(&mut self, buf: &mut BytesMut) -> usize {
        let phase = self.phase();
        let discarded = buf.len();
        let mid_payload = matches!(self.state, ParserState::AwaitingBody { .. });

        if discarded > 0 || mid_payload {
            self.report(FrameDiagnostic::TrailingBytes { phase, discarded });
        }

        buf.clear();
        self.state = ParserState::AwaitingHeaders;
        self.scanned = 0;
        discarded
    }
}

/// Split a header block on CRLF
fn header_lines(block: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut index = 0;

    while index + 1 < block.len() {
        if block[index] == b'\r' && block[index + 1] == b'\n' {
            lines.push(&block[start..index]);
            index += 2;
            start = index;
        } else {
            index += 1;
        }
    }
    lines.push(&block[start..]);

    lines
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_message(src))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = FramingError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

// ============================================================================
// Framer
// ============================================================================

/// Counters for one forwarded stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_read: u64,
    pub messages: u64,
    pub dropped_frames: u64,
    pub trailing_bytes: usize,
}

/// Live counters for one forwarded stream
///
/// Updated as the stream is forwarded and shared through an `Arc`, so the
/// counts survive a pump task that is aborted mid-stream.
#[derive(Debug, Default)]
pub struct StreamCounters {
    bytes_read: AtomicU64,
    messages: AtomicU64,
    dropped_frames: AtomicU64,
    trailing_bytes: AtomicUsize,
}

impl StreamCounters {
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            bytes_read: self.bytes_read.load(Ordering::Acquire),
            messages: self.messages.load(Ordering::Acquire),
            dropped_frames: self.dropped_frames.load(Ordering::Acquire),
            trailing_bytes: self.trailing_bytes.load(Ordering::Acquire),
        }
    }
}

/// Stateful framer for one stream direction
///
/// Owns the accumulating input buffer and the codec state. Never shared
/// between directions.
pub struct Framer {
    codec: MessageCodec,

    /// Accumulated, not yet framed input
    buffer: BytesMut,

    /// Scratch buffer for re-emission
    output: BytesMut,

    chunk_size: usize,

    counters: Arc<StreamCounters>,
}

impl Framer {
    pub fn new(source: impl Into<String>, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self::from_codec(MessageCodec::new(source, sink))
    }

    pub fn from_codec(codec: MessageCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(DEFAULT_READ_CHUNK_SIZE),
            output: BytesMut::new(),
            chunk_size: DEFAULT_READ_CHUNK_SIZE,
            counters: Arc::new(StreamCounters::default()),
        }
    }

    /// Set how many bytes are requested from the source per read
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Override the payload size limit of the underlying codec
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.codec = self.codec.with_max_message_size(max);
        self
    }

    pub fn dropped_frames(&self) -> u64 {
        self.codec.dropped_frames()
    }

    /// Handle on the counters updated by [`Framer::forward_stream`]
    pub fn counters(&self) -> Arc<StreamCounters> {
        Arc::clone(&self.counters)
    }

    /// Number of bytes waiting for the rest of their frame
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `bytes` and return every message completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, FramingError> {
        self.buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        while let Some(message) = self.codec.decode(&mut self.buffer)? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Drop any incomplete frame at end of stream, returning its size
    pub fn finish(&mut self) -> usize {
        self.codec.discard_incomplete(&mut self.buffer)
    }

    /// Write one message with a single write and a single flush
    ///
    /// Downstream JSON-RPC readers treat a flush as a message boundary, so
    /// the whole frame must reach the writer in one piece.
    pub async fn emit<W>(&mut self, message: &Message, writer: &mut W) -> Result<(), FramingError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.output.clear();
        self.codec.encode(message, &mut self.output)?;
        writer.write_all(&self.output).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Copy framed messages from `reader` to `writer` until end of stream
    ///
    /// Counters are updated as frames pass, so a caller holding
    /// [`Framer::counters`] sees the progress even if this future is dropped.
    pub async fn forward_stream<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<StreamStats, FramingError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let counters = self.counters();
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                trace!("Framer[{}]: end of stream", self.codec.source);
                break;
            }
            counters.bytes_read.fetch_add(read as u64, Ordering::AcqRel);

            let messages = self.feed(&chunk[..read])?;
            counters
                .dropped_frames
                .store(self.dropped_frames(), Ordering::Release);

            for message in messages {
                self.emit(&message, writer).await?;
                log_bsp_frame!(Level::TRACE, self.codec.source, message);
                counters.messages.fetch_add(1, Ordering::AcqRel);
            }
        }

        counters
            .trailing_bytes
            .store(self.finish(), Ordering::Release);
        Ok(counters.snapshot())
    }
}

// ============================================================================
// Tests
// ============================================================================
