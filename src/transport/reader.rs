//! Inbound pump.
//!
//! Reads engine stdout through [`FramedRead`] backed by [`NdjsonCodec`],
//! resolves each line with [`parse_line`], and forwards every resolved
//! [`Message`] through a tokio [`mpsc`] channel.
//!
//! Oversized, non-UTF-8, malformed, and unknown lines are logged and
//! skipped: one bad frame never ends the stream.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::{Frame, NdjsonCodec};
use crate::protocol::message::Message;
use crate::protocol::resolver::parse_line;
use crate::AppError;

/// Why the pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The engine closed stdout.
    Eof,
    /// Reading stdout failed.
    Io(String),
    /// The cancellation token fired.
    Cancelled,
    /// The receiving side of the message channel was dropped.
    ReceiverClosed,
}

/// Counters describing one pump run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Messages forwarded.
    pub forwarded: u64,
    /// Lines skipped (oversized, not UTF-8, malformed, or unknown kind).
    pub skipped: u64,
}

/// Pump `stdout` until EOF, an I/O error, or cancellation.
///
/// Respects `cancel`: when the token fires the pump exits without draining
/// the remaining bytes. The framed reader's buffer is local to this call, so a
/// new connection never resumes a partial line from an old one.
pub async fn run_reader<R>(
    stdout: R,
    max_line_bytes: usize,
    message_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) -> (ReaderExit, ReaderStats)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, NdjsonCodec::with_max_length(max_line_bytes));
    let mut stats = ReaderStats::default();

    let exit = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader: cancellation received, stopping");
                break ReaderExit::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("reader: EOF detected");
                        break ReaderExit::Eof;
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "reader: IO error, stopping");
                        break ReaderExit::Io(e.to_string());
                    }

                    Some(Ok(Frame::Oversized { limit })) => {
                        stats.skipped += 1;
                        warn!(limit, "reader: oversized frame, skipping");
                    }

                    Some(Ok(Frame::InvalidUtf8 { valid_up_to })) => {
                        stats.skipped += 1;
                        warn!(valid_up_to, "reader: line is not valid UTF-8, skipping");
                    }

                    Some(Ok(Frame::Line(line))) => match parse_line(&line) {
                        Ok(Some(message)) => {
                            stats.forwarded += 1;
                            if message_tx.send(message).await.is_err() {
                                debug!("reader: message receiver closed, stopping");
                                break ReaderExit::ReceiverClosed;
                            }
                        }
                        Ok(None) => {}
                        Err(e @ AppError::UnknownMessageKind(_)) => {
                            stats.skipped += 1;
                            debug!(error = %e, "reader: skipping unknown message kind");
                        }
                        Err(e) => {
                            stats.skipped += 1;
                            warn!(error = %e, raw_line = %line, "reader: parse error, skipping line");
                        }
                    },
                }
            }
        }
    };

    debug!(
        forwarded = stats.forwarded,
        skipped = stats.skipped,
        "reader: stopped"
    );
    (exit, stats)
}
