//! Audit dispatcher task.
//!
//! Drains the bounded audit queue one event at a time and runs each write on
//! a blocking thread, so a slow sink applies backpressure to the queue rather
//! than spawning unbounded concurrent writes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AuditLogger, ToolAuditEvent};

/// Spawn the dispatcher.
///
/// The task ends when every sender is dropped or `cancel` fires. Events
/// already queued at cancellation are still written.
#[must_use]
pub fn spawn_audit_dispatcher(
    logger: Arc<dyn AuditLogger>,
    mut events: mpsc::Receiver<ToolAuditEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                () = cancel.cancelled() => {
                    events.close();
                    events.recv().await
                }
            };
            let Some(event) = event else { break };
            write_event(&logger, event).await;
        }
        debug!("audit dispatcher stopped");
    })
}

async fn write_event(logger: &Arc<dyn AuditLogger>, event: ToolAuditEvent) {
    let logger = Arc::clone(logger);
    let tool_use_id = event.tool_use_id.clone();
    match tokio::task::spawn_blocking(move || logger.log_event(&event)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%tool_use_id, error = %err, "tool audit write failed"),
        Err(err) => warn!(%tool_use_id, error = %err, "tool audit task failed"),
    }
}
