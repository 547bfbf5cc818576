//! Content-Length framing for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! This module deals in bytes only: [`encode`], [`decode_header`] and
//! [`decode_body`] are the primitives, [`FrameReader`] and [`FrameWriter`]
//! wrap them around async streams. Turning a payload into a JSON-RPC
//! message is [`crate::message`]'s job.

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::LspError;

/// Default frame size cap (4 MiB) to prevent unbounded memory allocation.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// One length-prefixed wire unit.
///
/// The declared length is derived from the payload, so the two can never
/// disagree. Frames are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Byte length announced in the `Content-Length` header.
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Header plus payload, ready to be written to the wire.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        encode(&self.payload)
    }
}

/// Prepend the `Content-Length` header and the empty-line delimiter.
#[must_use]
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", payload.len());
    let mut wire = Vec::with_capacity(header.len() + payload.len());
    wire.extend_from_slice(header.as_bytes());
    wire.extend_from_slice(payload);
    wire
}

/// Parse headers up to and including the empty line separator.
///
/// Returns `Ok(None)` on EOF before any header byte (clean end of stream).
/// A bad `Content-Length` value is only reported once the delimiter has been
/// consumed, so the stream is positioned at the body when this returns.
pub async fn decode_header<R>(reader: &mut R) -> Result<Option<usize>, LspError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut bad_value: Option<String> = None;
    let mut line = Vec::new();
    let mut saw_any_header_bytes = false;

    loop {
        line.clear();
        let bytes_read = reader.read_until(b'\n', &mut line).await?;

        if bytes_read == 0 {
            // Note: `content_length == None` doesn't imply "no headers read"
            // (e.g. EOF after reading only Content-Type is still truncation).
            if !saw_any_header_bytes {
                return Ok(None);
            }
            return Err(LspError::TruncatedStream(
                "EOF before end of headers".to_string(),
            ));
        }
        saw_any_header_bytes = true;

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            break;
        }

        let header = resync(trimmed);
        let Some((key, value)) = header.split_once(':') else {
            continue;
        };
        // LSP uses "Content-Length" but parse case-insensitively for robustness.
        // Other headers (e.g. Content-Type) are ignored.
        if key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            match value.trim().parse::<usize>() {
                Ok(len) => {
                    content_length = Some(len);
                    bad_value = None;
                }
                Err(_) => bad_value = Some(value.trim().to_string()),
            }
        }
    }

    if let Some(value) = bad_value {
        return Err(LspError::MalformedFrame(format!(
            "invalid {CONTENT_LENGTH} value {value:?}"
        )));
    }
    match content_length {
        Some(len) => Ok(Some(len)),
        None => Err(LspError::MalformedFrame(format!(
            "missing {CONTENT_LENGTH} header"
        ))),
    }
}

/// Skip leading bytes in front of a `Content-Length` token.
///
/// The unread body of a rejected frame has no trailing newline, so it ends up
/// glued to the next header line.
fn resync(line: &str) -> &str {
    let lowered = line.to_ascii_lowercase();
    match lowered.find("content-length:") {
        Some(pos) if pos > 0 => {
            tracing::debug!(skipped = pos, "Discarding bytes before Content-Length header");
            &line[pos..]
        }
        _ => line,
    }
}

/// Read exactly `content_length` payload bytes.
pub async fn decode_body<R>(reader: &mut R, content_length: usize) -> Result<Vec<u8>, LspError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; content_length];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            LspError::TruncatedStream(format!("expected {content_length} body bytes")),
        ),
        Err(e) => Err(LspError::Io(e)),
    }
}

/// Reads frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_bytes(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF (clean shutdown). `MalformedFrame` leaves
    /// the reader aligned on the next frame, so callers may keep reading;
    /// `TruncatedStream` means the stream is gone.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, LspError> {
        let Some(content_length) = decode_header(&mut self.reader).await? else {
            return Ok(None);
        };

        if content_length > self.max_frame_bytes {
            let skipped = tokio::io::copy(
                &mut (&mut self.reader).take(content_length as u64),
                &mut tokio::io::sink(),
            )
            .await?;
            if skipped < content_length as u64 {
                return Err(LspError::TruncatedStream(format!(
                    "expected {content_length} body bytes"
                )));
            }
            return Err(LspError::MalformedFrame(format!(
                "{CONTENT_LENGTH} {content_length} exceeds maximum {}",
                self.max_frame_bytes
            )));
        }

        let body = decode_body(&mut self.reader, content_length).await?;
        Ok(Some(Frame::new(body)))
    }
}

/// Writes frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a frame with its `Content-Length` header and flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.writer.write_all(&frame.to_wire()).await?;
        self.writer.flush().await
    }

    /// Direct access to the underlying stream, bypassing framing.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}
