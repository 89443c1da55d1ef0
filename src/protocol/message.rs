//! Typed inbound messages produced by the engine.
//!
//! [`Message`] is a closed set; [`resolve`](crate::protocol::resolver::resolve)
//! is the only constructor used on the inbound path.

use serde::Serialize;
use serde_json::Value;

/// One typed unit inside an assistant or user turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text {
        /// The text.
        text: String,
    },
    /// Reasoning output.
    Thinking {
        /// Reasoning text; empty for redacted blocks.
        thinking: String,
        /// Engine signature over the reasoning, when provided.
        signature: Option<String>,
        /// Whether the engine redacted the reasoning.
        redacted: bool,
    },
    /// A tool invocation requested by the assistant.
    ToolUse {
        /// Invocation identifier, echoed by the matching result.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input payload.
        input: Value,
    },
    /// The outcome of a tool invocation.
    ToolResult {
        /// Identifier of the invocation this result answers.
        tool_use_id: String,
        /// Result payload (string or structured blocks).
        content: Value,
        /// Whether the tool reported failure.
        is_error: bool,
    },
}

impl ContentBlock {
    /// Text of a `Text` block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Engine capabilities announced at the start of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitMessage {
    /// Engine session identifier.
    pub session_id: String,
    /// Active model, when announced.
    pub model: Option<String>,
    /// Working directory of the engine.
    pub cwd: Option<String>,
    /// Tools available to the engine.
    pub tools: Vec<String>,
    /// Permission mode in effect.
    pub permission_mode: Option<String>,
    /// The full `init` payload.
    pub raw: Value,
}

/// One role's contribution to the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnMessage {
    /// Engine session identifier carried by the line.
    pub session_id: Option<String>,
    /// Tool invocation this turn answers, for nested (sub-agent) turns.
    pub parent_tool_use_id: Option<String>,
    /// Model that produced an assistant turn.
    pub model: Option<String>,
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
}

impl TurnMessage {
    /// Concatenated text of every `Text` block.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Iterator over `(id, name, input)` of every tool invocation.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    /// Iterator over `(tool_use_id, content, is_error)` of every tool result.
    pub fn tool_results(&self) -> impl Iterator<Item = (&str, &Value, bool)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some((tool_use_id.as_str(), content, *is_error)),
            _ => None,
        })
    }
}

/// Payload of a partial fragment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaFragment {
    /// Streamed text.
    Text {
        /// Fragment text.
        text: String,
    },
    /// Streamed reasoning.
    Thinking {
        /// Fragment reasoning text.
        thinking: String,
    },
    /// Streamed partial JSON of a tool input.
    InputJson {
        /// Partial JSON text.
        partial_json: String,
    },
    /// Any other stream event (block start/stop, message start/stop).
    Event {
        /// The raw event object.
        event: Value,
    },
}

/// Partial fragment of an in-progress turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaMessage {
    /// Engine session identifier carried by the line.
    pub session_id: Option<String>,
    /// Stream event type (`content_block_delta`, `message_start`, …).
    pub event_type: String,
    /// Content block index the fragment belongs to.
    pub index: Option<u64>,
    /// Fragment payload.
    pub fragment: DeltaFragment,
}

impl DeltaMessage {
    /// Fragment text for text deltas.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.fragment {
            DeltaFragment::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Outcome classification of a terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The turn completed.
    Success,
    /// The engine reported an error subtype (`error_max_turns`, …).
    Error(String),
}

/// Terminal message of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMessage {
    /// Outcome classification.
    pub status: ResultStatus,
    /// Whether the engine flagged the result as an error.
    pub is_error: bool,
    /// Final text, when the engine produced one.
    pub text: Option<String>,
    /// Engine session identifier.
    pub session_id: String,
    /// Wall-clock duration reported by the engine.
    pub duration_ms: Option<u64>,
    /// Model API duration reported by the engine.
    pub duration_api_ms: Option<u64>,
    /// Number of turns taken.
    pub num_turns: Option<u64>,
    /// Total cost reported by the engine.
    pub total_cost_usd: Option<f64>,
    /// Aggregated token usage.
    pub usage: Option<Value>,
}

impl ResultMessage {
    /// Whether the result reports success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success && !self.is_error
    }
}

/// Reply to a control request issued by this client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponseMessage {
    /// Identifier of the control request being answered.
    pub request_id: String,
    /// `Ok(response)` on success, `Err(error)` when the engine refused.
    pub outcome: std::result::Result<Value, String>,
}

/// Control request initiated by the engine (for example `can_use_tool`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlRequestMessage {
    /// Identifier to echo in the response.
    pub request_id: String,
    /// Request subtype.
    pub subtype: String,
    /// The full `request` object.
    pub request: Value,
}

/// Closed set of messages the engine may emit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Message {
    /// Engine capabilities and session identifier.
    Init(InitMessage),
    /// Other `system` notifications (for example `compact_boundary`).
    System {
        /// System subtype.
        subtype: String,
        /// Engine session identifier, when present.
        session_id: Option<String>,
        /// The full payload.
        data: Value,
    },
    /// Assistant output.
    AgentTurn(TurnMessage),
    /// Tool results submitted back to the engine.
    UserTurn(TurnMessage),
    /// Partial fragment of an in-progress turn.
    Delta(DeltaMessage),
    /// Terminal result.
    Result(ResultMessage),
    /// Reply to a client control request.
    ControlResponse(ControlResponseMessage),
    /// Control request initiated by the engine.
    ControlRequest(ControlRequestMessage),
}

impl Message {
    /// Wire discriminator the message was resolved from.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) | Self::System { .. } => "system",
            Self::AgentTurn(_) => "assistant",
            Self::UserTurn(_) => "user",
            Self::Delta(_) => "stream_event",
            Self::Result(_) => "result",
            Self::ControlResponse(_) => "control_response",
            Self::ControlRequest(_) => "control_request",
        }
    }

    /// Engine session identifier embedded in the message.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Init(init) => Some(&init.session_id),
            Self::System { session_id, .. } => session_id.as_deref(),
            Self::AgentTurn(turn) | Self::UserTurn(turn) => turn.session_id.as_deref(),
            Self::Delta(delta) => delta.session_id.as_deref(),
            Self::Result(result) => Some(&result.session_id),
            Self::ControlResponse(_) | Self::ControlRequest(_) => None,
        }
    }

    /// Whether this message terminates a request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Whether the message belongs to the control protocol rather than a query.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::ControlResponse(_) | Self::ControlRequest(_))
    }
}
