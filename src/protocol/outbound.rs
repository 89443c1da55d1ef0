//! Outbound frames written to the engine's stdin.
//!
//! ```json
//! {"type":"user","message":{"role":"user","content":"2+2"},"parent_tool_use_id":null,"session_id":"default"}
//! {"type":"control_request","request_id":"req_1","request":{"subtype":"interrupt"}}
//! {"type":"control_response","response":{"subtype":"success","request_id":"req_9","response":{}}}
//! ```

use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// Session identifier used before the engine announces one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Content of a user turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UserContent {
    /// Plain prompt text.
    Text(String),
    /// Structured content blocks (text, images, tool results).
    Blocks(Vec<Value>),
}

/// A query submitted by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPayload {
    /// Turn content.
    pub content: UserContent,
    /// Tool invocation this turn replies to, if any.
    pub parent_tool_use_id: Option<String>,
}

impl QueryPayload {
    /// A plain-text prompt.
    #[must_use]
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            content: UserContent::Text(prompt.into()),
            parent_tool_use_id: None,
        }
    }

    /// Structured content blocks.
    #[must_use]
    pub fn blocks(blocks: Vec<Value>) -> Self {
        Self {
            content: UserContent::Blocks(blocks),
            parent_tool_use_id: None,
        }
    }

    /// Mark the payload as a reply to a tool prompt.
    #[must_use]
    pub fn with_parent_tool_use(mut self, tool_use_id: impl Into<String>) -> Self {
        self.parent_tool_use_id = Some(tool_use_id.into());
        self
    }
}

impl From<&str> for QueryPayload {
    fn from(prompt: &str) -> Self {
        Self::text(prompt)
    }
}

impl From<String> for QueryPayload {
    fn from(prompt: String) -> Self {
        Self::text(prompt)
    }
}

#[derive(Debug, Serialize)]
struct UserMessageBody<'a> {
    role: &'static str,
    content: &'a UserContent,
}

/// Control request subtypes sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestBody {
    /// Start the control handshake.
    Initialize {
        /// Hook registrations; none are sent by this client.
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks: Option<Value>,
    },
    /// Stop the in-progress turn.
    Interrupt,
    /// Switch the active model; `None` restores the default.
    SetModel {
        /// Model name.
        model: Option<String>,
    },
    /// Change the permission mode.
    SetPermissionMode {
        /// Mode name.
        mode: String,
    },
}

/// Every frame kind written to the engine.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    User {
        message: UserMessageBody<'a>,
        parent_tool_use_id: Option<&'a str>,
        session_id: &'a str,
    },
    ControlRequest {
        request_id: &'a str,
        request: &'a ControlRequestBody,
    },
    ControlResponse {
        response: Value,
    },
}

/// Encode a user turn as a single-line JSON value.
///
/// # Errors
///
/// Returns [`crate::AppError::Io`] if serialization fails.
pub fn encode_user(payload: &QueryPayload, session_id: &str) -> Result<Value> {
    let frame = OutboundFrame::User {
        message: UserMessageBody {
            role: "user",
            content: &payload.content,
        },
        parent_tool_use_id: payload.parent_tool_use_id.as_deref(),
        session_id,
    };
    Ok(serde_json::to_value(&frame)?)
}

/// Encode a client control request.
///
/// # Errors
///
/// Returns [`crate::AppError::Io`] if serialization fails.
pub fn encode_control_request(request_id: &str, body: &ControlRequestBody) -> Result<Value> {
    let frame = OutboundFrame::ControlRequest {
        request_id,
        request: body,
    };
    Ok(serde_json::to_value(&frame)?)
}

/// Encode a control request whose subtype has no typed body.
///
/// `fields` are merged into the `request` object next to `subtype`.
///
/// # Errors
///
/// Returns [`crate::AppError::Io`] if serialization fails.
pub fn encode_custom_control_request(
    request_id: &str,
    subtype: &str,
    mut fields: serde_json::Map<String, Value>,
) -> Result<Value> {
    fields.insert("subtype".into(), Value::String(subtype.to_owned()));
    Ok(serde_json::json!({
        "type": "control_request",
        "request_id": request_id,
        "request": fields,
    }))
}

/// Encode the reply to an engine-initiated control request.
///
/// # Errors
///
/// Returns [`crate::AppError::Io`] if serialization fails.
pub fn encode_control_response(
    request_id: &str,
    outcome: &std::result::Result<Value, String>,
) -> Result<Value> {
    let response = match outcome {
        Ok(response) => serde_json::json!({
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }),
        Err(error) => serde_json::json!({
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        }),
    };
    Ok(serde_json::to_value(&OutboundFrame::ControlResponse { response })?)
}
