//! JSON-RPC framing over duplex byte streams.
//!
//! Two wire conventions are supported and autodetected:
//!
//! - **Header mode**: each frame is a `Content-Length: N` header block
//!   terminated by a blank line, followed by exactly N body bytes.
//! - **Newline mode**: each frame is one line of JSON terminated by LF.
//!
//! Detection looks at the first non-whitespace byte of a frame: `{` or `[`
//! means newline mode, anything else is treated as the start of a header
//! block. Once a frame has been read successfully the detected mode is
//! pinned for writes; until then writes follow the configured preference.
//!
//! Reads are owned by a single pump task per connection. Writes may come
//! from many tasks and are serialized through a mutex so frames are never
//! interleaved on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::config::StdioMode;
use crate::error::FramingError;

/// Maximum size of a single frame body or line (10 MiB).
///
/// Checked before JSON parsing so crafted input cannot force allocation of
/// oversized value trees.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Maximum size of a single header line.
const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireMode {
    Header,
    Newline,
}

/// Write-mode state shared between the reader and writer halves.
///
/// Starts at the configured preference and pins to the dialect observed on
/// the first successfully read frame.
#[derive(Debug)]
struct ModeCell {
    newline: AtomicBool,
    pinned: AtomicBool,
}

impl ModeCell {
    fn new(prefer: StdioMode) -> Self {
        Self {
            newline: AtomicBool::new(matches!(prefer, StdioMode::Newline)),
            pinned: AtomicBool::new(false),
        }
    }

    fn write_mode(&self) -> WireMode {
        if self.newline.load(Ordering::Acquire) {
            WireMode::Newline
        } else {
            WireMode::Header
        }
    }

    fn observe(&self, mode: WireMode) {
        if self.pinned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.newline
            .store(mode == WireMode::Newline, Ordering::Release);
    }
}

/// Reading half of a framed connection. Owned by exactly one pump task.
pub struct FrameReader {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    mode: Arc<ModeCell>,
    peer: String,
}

/// Writing half of a framed connection. Cheap to share; all writes go
/// through an internal mutex and are flushed per message.
pub struct FrameWriter {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    mode: Arc<ModeCell>,
    peer: String,
}

/// Wrap a byte stream pair into framed reader and writer halves.
pub fn frame_pair(
    read: impl AsyncRead + Send + Unpin + 'static,
    write: impl AsyncWrite + Send + Unpin + 'static,
    peer: impl Into<String>,
    prefer: StdioMode,
) -> (FrameReader, FrameWriter) {
    let peer = peer.into();
    let mode = Arc::new(ModeCell::new(prefer));
    let reader = FrameReader {
        reader: BufReader::new(Box::new(read)),
        mode: mode.clone(),
        peer: peer.clone(),
    };
    let writer = FrameWriter {
        writer: Mutex::new(Box::new(write)),
        mode,
        peer,
    };
    (reader, writer)
}

impl FrameReader {
    /// Read the next JSON-RPC message.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. A malformed
    /// frame returns an error but leaves the stream positioned at the next
    /// frame; only IO errors are terminal.
    pub async fn read_message(&mut self) -> Result<Option<Value>, FramingError> {
        let first = match self.peek_non_whitespace().await? {
            Some(byte) => byte,
            None => return Ok(None),
        };

        if first == b'{' || first == b'[' {
            // Newline-delimited JSON pins the connection immediately.
            self.mode.observe(WireMode::Newline);
            self.read_newline_frame().await
        } else {
            self.read_header_frame().await
        }
    }

    /// Skip whitespace between frames and peek at the next byte without
    /// consuming it. Returns `None` on EOF.
    async fn peek_non_whitespace(&mut self) -> Result<Option<u8>, FramingError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            match available.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(pos) => {
                    let byte = available[pos];
                    self.reader.consume(pos);
                    return Ok(Some(byte));
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    async fn read_newline_frame(&mut self) -> Result<Option<Value>, FramingError> {
        let mut line = Vec::new();
        let n = bounded_read_line(&mut self.reader, &mut line, MAX_FRAME_BYTES).await?;
        if n == 0 {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        match serde_json::from_str(trimmed) {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(FramingError::MalformedJson {
                reason: e.to_string(),
            }),
        }
    }

    async fn read_header_frame(&mut self) -> Result<Option<Value>, FramingError> {
        let mut content_length: Option<usize> = None;

        loop {
            let mut line_buf = Vec::new();
            let n =
                bounded_read_line(&mut self.reader, &mut line_buf, MAX_HEADER_LINE_BYTES).await?;
            if n == 0 {
                // EOF before the blank-line terminator.
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&line_buf);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }
            match trimmed.split_once(':') {
                None => {
                    tracing::warn!(
                        peer = %self.peer,
                        line = %trimmed,
                        "skipping non-header line in frame header block"
                    );
                }
                Some((name, value)) => {
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        let parsed = value.trim().parse::<usize>().map_err(|_| {
                            FramingError::MalformedHeader {
                                reason: format!("invalid Content-Length value '{}'", value.trim()),
                            }
                        })?;
                        content_length = Some(parsed);
                    } else {
                        tracing::warn!(
                            peer = %self.peer,
                            header = %name.trim(),
                            "tolerating unknown frame header"
                        );
                    }
                }
            }
        }

        let length = content_length.ok_or_else(|| FramingError::MalformedHeader {
            reason: "missing Content-Length header".to_string(),
        })?;
        if length > MAX_FRAME_BYTES {
            // Consume the declared body so the stream stays frame-aligned.
            discard_exact(&mut self.reader, length).await?;
            return Err(FramingError::MessageTooLarge {
                max_bytes: MAX_FRAME_BYTES,
            });
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;

        self.mode.observe(WireMode::Header);
        match serde_json::from_slice(&body) {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(FramingError::MalformedJson {
                reason: e.to_string(),
            }),
        }
    }
}

impl FrameWriter {
    /// Serialize and send one message, framed per the current write mode.
    ///
    /// The whole frame is assembled up front and written under the lock, so
    /// concurrent producers can never interleave partial frames.
    pub async fn write_message(&self, message: &Value) -> Result<(), FramingError> {
        let body = serde_json::to_vec(message).map_err(|e| FramingError::MalformedJson {
            reason: e.to_string(),
        })?;

        let mut frame = Vec::with_capacity(body.len() + 32);
        match self.mode.write_mode() {
            WireMode::Header => {
                frame.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
                frame.extend_from_slice(&body);
            }
            WireMode::Newline => {
                frame.extend_from_slice(&body);
                frame.push(b'\n');
            }
        }

        let mut guard = self.writer.lock().await;
        guard.write_all(&frame).await?;
        guard.flush().await?;
        tracing::trace!(peer = %self.peer, bytes = frame.len(), "frame written");
        Ok(())
    }
}

/// Read a single line, enforcing a byte limit.
///
/// Unlike a bare `read_line`, this will not allocate unbounded memory if the
/// peer streams bytes without a newline. On overflow the remainder of the
/// line is drained so the reader stays positioned at the next line.
///
/// Returns the number of bytes read including the newline; 0 means EOF.
async fn bounded_read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let to_consume = pos + 1;
                if total + to_consume > max_bytes {
                    reader.consume(to_consume);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }
                buf.extend_from_slice(&available[..to_consume]);
                total += to_consume;
                reader.consume(to_consume);
                return Ok(total);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    reader.consume(len);
                    drain_until_newline(reader).await;
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }
                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}

/// Drain bytes until a newline or EOF, bounded by a 30 second timeout so a
/// stalled peer cannot wedge the pump.
async fn drain_until_newline<R: AsyncBufRead + Unpin>(reader: &mut R) {
    let drain = async {
        loop {
            match reader.fill_buf().await {
                Ok([]) => return,
                Ok(buf) => {
                    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        reader.consume(pos + 1);
                        return;
                    }
                    let len = buf.len();
                    reader.consume(len);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "io error while draining oversized line");
                    return;
                }
            }
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(30), drain)
        .await
        .is_err()
    {
        tracing::warn!("timed out draining oversized line");
    }
}

/// Consume exactly `count` bytes without buffering them.
async fn discard_exact<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    mut count: usize,
) -> Result<(), FramingError> {
    while count > 0 {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(FramingError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed while discarding oversized frame body",
            )));
        }
        let len = available.len().min(count);
        reader.consume(len);
        count -= len;
    }
    Ok(())
}
