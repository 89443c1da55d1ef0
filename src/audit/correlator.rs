//! Tool-use correlator.
//!
//! Pairs `tool_use` blocks from assistant turns with `tool_result` blocks from
//! later user turns by invocation identifier. Any number of unrelated messages
//! may separate the two halves of a pair.
//!
//! Memory is bounded two ways: without a sink nothing is recorded at all, and
//! [`ToolUseCorrelator::release`] drops every invocation still pending when
//! its owning request completes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ToolAuditEvent;
use crate::protocol::message::Message;

/// A tool invocation awaiting its result.
#[derive(Debug, Clone)]
struct PendingToolInvocation {
    request_id: String,
    tool_name: String,
    input: Value,
    started_at: DateTime<Utc>,
}

/// Correlates tool invocations with their results.
///
/// Owned by the registry task; every method runs at that single
/// serialization point, so no locking is needed.
#[derive(Debug)]
pub struct ToolUseCorrelator {
    sink: Option<mpsc::Sender<ToolAuditEvent>>,
    pending: HashMap<String, PendingToolInvocation>,
    emitted: u64,
    dropped: u64,
}

impl ToolUseCorrelator {
    /// Build a correlator emitting into `sink`; `None` disables recording.
    #[must_use]
    pub fn new(sink: Option<mpsc::Sender<ToolAuditEvent>>) -> Self {
        Self {
            sink,
            pending: HashMap::new(),
            emitted: 0,
            dropped: 0,
        }
    }

    /// Whether events are being recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.as_ref().is_some_and(|sink| !sink.is_closed())
    }

    /// Observe one message routed to `request_id`.
    pub fn observe(&mut self, request_id: &str, message: &Message) {
        if !self.is_enabled() {
            return;
        }

        match message {
            Message::AgentTurn(turn) => {
                let now = Utc::now();
                for (id, name, input) in turn.tool_uses() {
                    let previous = self.pending.insert(
                        id.to_owned(),
                        PendingToolInvocation {
                            request_id: request_id.to_owned(),
                            tool_name: name.to_owned(),
                            input: input.clone(),
                            started_at: now,
                        },
                    );
                    if previous.is_some() {
                        warn!(tool_use_id = id, "duplicate tool invocation id, replacing");
                    } else {
                        debug!(tool_use_id = id, tool = name, request_id, "tool invocation pending");
                    }
                }
            }
            Message::UserTurn(turn) => {
                for (id, content, is_error) in turn.tool_results() {
                    let Some(pending) = self.pending.remove(id) else {
                        debug!(tool_use_id = id, "tool result without pending invocation, ignoring");
                        continue;
                    };
                    let completed_at = Utc::now();
                    self.emit(ToolAuditEvent {
                        request_id: pending.request_id,
                        session_id: turn.session_id.clone(),
                        tool_use_id: id.to_owned(),
                        tool_name: pending.tool_name,
                        input: pending.input,
                        result: content.clone(),
                        is_error,
                        started_at: pending.started_at,
                        completed_at,
                        duration_ms: (completed_at - pending.started_at).num_milliseconds(),
                    });
                }
            }
            _ => {}
        }
    }

    /// Drop every invocation still pending for `request_id`.
    ///
    /// Returns how many were discarded.
    pub fn release(&mut self, request_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.request_id != request_id);
        let discarded = before - self.pending.len();
        if discarded > 0 {
            debug!(request_id, discarded, "discarded unmatched tool invocations");
        }
        discarded
    }

    /// Number of invocations awaiting a result.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of events handed to the sink.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Number of events lost to a full or closed sink.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn emit(&mut self, event: ToolAuditEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        let tool_use_id = event.tool_use_id.clone();
        match sink.try_send(event) {
            Ok(()) => {
                self.emitted += 1;
                debug!(tool_use_id = %tool_use_id, "tool audit event queued");
            }
            Err(err) => {
                self.dropped += 1;
                warn!(tool_use_id = %tool_use_id, error = %err, "tool audit event dropped");
            }
        }
    }
}
