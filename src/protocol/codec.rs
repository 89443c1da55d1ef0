//! NDJSON framing for engine streams.
//!
//! Two entry points share one line-extraction routine:
//!
//! - [`decode_frames`]: a pure function over `(unresolved, incoming)` bytes,
//!   returning the complete lines and the new unresolved remainder.
//! - [`NdjsonCodec`]: a [`Decoder`]/[`Encoder`] pair for
//!   [`tokio_util::codec::FramedRead`] and [`tokio_util::codec::FramedWrite`],
//!   where the framed reader's buffer is the accumulating read buffer.
//!
//! Lines are delimited by `\n`; a trailing `\r` is stripped and blank lines
//! are not frames. A line longer than the configured limit yields
//! [`Frame::Oversized`] once, after which the decoder discards bytes up to the
//! next newline and resumes. A line that is not valid UTF-8 yields
//! [`Frame::InvalidUtf8`] and is never repaired. Both are items rather than
//! decode errors because a decode error ends a `FramedRead` stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{AppError, Result};

/// Default maximum inbound line length: 8 MiB.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// One decoded unit of an inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its delimiter.
    Line(String),
    /// A line exceeded the limit and was discarded.
    Oversized {
        /// The limit that was exceeded.
        limit: usize,
    },
    /// A line was not valid UTF-8 and was discarded.
    InvalidUtf8 {
        /// Length of the valid prefix.
        valid_up_to: usize,
    },
}

impl Frame {
    /// Convert to the line text.
    ///
    /// # Errors
    ///
    /// - [`AppError::FrameTooLong`] for [`Frame::Oversized`].
    /// - [`AppError::MalformedMessage`] with kind `<invalid-utf8>` for
    ///   [`Frame::InvalidUtf8`].
    pub fn into_line(self) -> Result<String> {
        match self {
            Self::Line(line) => Ok(line),
            Self::Oversized { limit } => Err(AppError::FrameTooLong(limit)),
            Self::InvalidUtf8 { valid_up_to } => Err(AppError::MalformedMessage {
                kind: "<invalid-utf8>".into(),
                fields: vec![format!("invalid byte at offset {valid_up_to}")],
            }),
        }
    }
}

/// Output of [`decode_frames`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrames {
    /// Complete lines, in arrival order, without their delimiter.
    pub lines: Vec<String>,
    /// Bytes of a trailing partial line, to be passed back on the next read.
    pub remainder: Vec<u8>,
    /// Complete lines dropped because they were not valid UTF-8.
    pub invalid: usize,
}

/// Split `unresolved ++ incoming` into complete lines and a remainder.
///
/// Pure: feeding the same bytes split across any number of calls yields the
/// same lines as one call over the concatenation. No length limit is applied;
/// use [`NdjsonCodec`] on untrusted streams.
#[must_use]
pub fn decode_frames(unresolved: &[u8], incoming: &[u8]) -> DecodedFrames {
    let mut buf = BytesMut::with_capacity(unresolved.len() + incoming.len());
    buf.extend_from_slice(unresolved);
    buf.extend_from_slice(incoming);

    let mut lines = Vec::new();
    let mut invalid = 0;
    let mut scanned = 0;
    while let Some(line) = take_line(&mut buf, &mut scanned) {
        match frame_of(&line) {
            Some(Frame::Line(line)) => lines.push(line),
            Some(_) => invalid += 1,
            None => {}
        }
    }

    DecodedFrames {
        lines,
        remainder: buf.to_vec(),
        invalid,
    }
}

/// Remove the next `\n`-terminated line from `buf`, without the delimiter.
///
/// `scanned` records how many bytes of `buf` are already known to contain no
/// newline, so repeated calls on a growing buffer stay linear.
fn take_line(buf: &mut BytesMut, scanned: &mut usize) -> Option<BytesMut> {
    let offset = buf[*scanned..].iter().position(|b| *b == b'\n');
    match offset {
        Some(offset) => {
            let end = *scanned + offset;
            let line = buf.split_to(end);
            buf.advance(1);
            *scanned = 0;
            Some(line)
        }
        None => {
            *scanned = buf.len();
            None
        }
    }
}

/// Convert a raw line to a frame; `None` for blank lines.
fn frame_of(line: &[u8]) -> Option<Frame> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    match std::str::from_utf8(line) {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => Some(Frame::Line(text.to_owned())),
        Err(err) => Some(Frame::InvalidUtf8 {
            valid_up_to: err.valid_up_to(),
        }),
    }
}

/// NDJSON codec for bidirectional engine streams.
///
/// # Decoder
///
/// Yields one [`Frame::Line`] per non-blank line. A line longer than the limit
/// yields [`Frame::Oversized`]; the rest of that line is discarded. A line
/// that is not valid UTF-8 yields [`Frame::InvalidUtf8`].
///
/// # Encoder
///
/// Outbound strings are encoded as `item\n`, for use with
/// [`tokio_util::codec::FramedWrite`]. Embedded newlines are rejected: a
/// compact JSON encoding never contains one.
#[derive(Debug)]
pub struct NdjsonCodec {
    max_length: usize,
    scanned: usize,
    discarding: bool,
}

impl NdjsonCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with an explicit line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
            discarding: false,
        }
    }

    /// The configured line limit.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if self.discarding {
                if let Some(pos) = src.iter().position(|b| *b == b'\n') {
                    src.advance(pos + 1);
                    self.discarding = false;
                    self.scanned = 0;
                } else {
                    src.clear();
                    return Ok(None);
                }
            }

            match take_line(src, &mut self.scanned) {
                Some(line) if line.len() > self.max_length => {
                    return Ok(Some(Frame::Oversized {
                        limit: self.max_length,
                    }));
                }
                Some(line) => {
                    if let Some(frame) = frame_of(&line) {
                        return Ok(Some(frame));
                    }
                }
                None if src.len() > self.max_length => {
                    src.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Ok(Some(Frame::Oversized {
                        limit: self.max_length,
                    }));
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if self.discarding {
            src.clear();
            self.discarding = false;
            return Ok(None);
        }
        // A final line without a delimiter is still a frame.
        self.scanned = 0;
        let rest = src.split();
        Ok(frame_of(&rest))
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        if item.contains('\n') {
            return Err(AppError::Io(
                "outbound frame contains an embedded newline".into(),
            ));
        }
        dst.reserve(item.len() + 1);
        dst.put(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
