//! Tool-use auditing.
//!
//! The [`ToolUseCorrelator`] pairs each tool invocation with its result and
//! emits one [`ToolAuditEvent`] per completed pair. Events travel over a
//! bounded queue to the dispatcher task, which hands them to an
//! [`AuditLogger`]. The shipped logger, [`JsonlAuditWriter`], appends JSONL
//! records to daily-rotating files.

pub mod correlator;
pub mod dispatcher;
pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One completed tool invocation/result pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolAuditEvent {
    /// Local request that observed the invocation.
    pub request_id: String,
    /// Engine session identifier, when known.
    pub session_id: Option<String>,
    /// Invocation identifier shared by the invocation and its result.
    pub tool_use_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Tool input payload.
    pub input: Value,
    /// Tool result payload.
    pub result: Value,
    /// Whether the tool reported failure.
    pub is_error: bool,
    /// When the invocation was observed.
    pub started_at: DateTime<Utc>,
    /// When the result was observed.
    pub completed_at: DateTime<Utc>,
    /// `completed_at - started_at` in milliseconds.
    pub duration_ms: i64,
}

/// Writes tool audit events to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`]. Calls are made from a
/// blocking thread, so implementations may perform synchronous I/O.
pub trait AuditLogger: Send + Sync {
    /// Record a single event.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_event(&self, event: &ToolAuditEvent) -> crate::Result<()>;
}

pub use correlator::ToolUseCorrelator;
pub use dispatcher::spawn_audit_dispatcher;
pub use writer::JsonlAuditWriter;
