//! Outbound writer task.
//!
//! Receives JSON values from a tokio [`mpsc`] channel, serializes each to a
//! compact single line, and sends it through a [`FramedWrite`] backed by
//! [`NdjsonCodec`], which appends the `\n` and flushes. Closing the sink on
//! exit shuts down stdin, which the engine observes as end of input.

use futures_util::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::NdjsonCodec;
use crate::{AppError, Result};

/// Writer task: serialize outbound values and write them to `stdin`.
///
/// The task exits cleanly when `cancel` fires or when every sender of
/// `frame_rx` is dropped.
///
/// # Errors
///
/// - [`AppError::Io`] if a value cannot be serialized.
/// - [`AppError::ChannelClosed`] if writing or flushing `stdin` fails
///   (typically because the engine exited).
pub async fn run_writer<W>(
    stdin: W,
    mut frame_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut sink = FramedWrite::new(stdin, NdjsonCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("writer: cancellation received, stopping");
                break;
            }

            frame = frame_rx.recv() => {
                let Some(value) = frame else {
                    debug!("writer: frame channel closed, stopping");
                    break;
                };

                let line = serde_json::to_string(&value)
                    .map_err(|e| AppError::Io(format!("failed to serialize outbound frame: {e}")))?;

                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "writer: write to stdin failed");
                    return Err(AppError::ChannelClosed(format!("write failed: {e}")));
                }
            }
        }
    }

    sink.close().await.ok();
    Ok(())
}
