//! Message resolver: decoded JSON object → typed [`Message`].
//!
//! Dispatches on the `type` discriminator.
//!
//! | `type`             | Resolves to                                   |
//! |--------------------|-----------------------------------------------|
//! | `system`           | [`Message::Init`] (`subtype = init`) or [`Message::System`] |
//! | `assistant`        | [`Message::AgentTurn`]                        |
//! | `user`             | [`Message::UserTurn`]                         |
//! | `stream_event`     | [`Message::Delta`]                            |
//! | `result`           | [`Message::Result`]                           |
//! | `control_response` | [`Message::ControlResponse`]                  |
//! | `control_request`  | [`Message::ControlRequest`]                   |
//! | *(any other)*      | [`AppError::UnknownMessageKind`]              |
//!
//! A known kind with missing or mistyped required fields yields
//! [`AppError::MalformedMessage`] naming every offending field. Resolution
//! never panics and never substitutes a default for a required field.

use serde_json::{Map, Value};

use crate::protocol::message::{
    ContentBlock, ControlRequestMessage, ControlResponseMessage, DeltaFragment, DeltaMessage,
    InitMessage, Message, ResultMessage, ResultStatus, TurnMessage,
};
use crate::{AppError, Result};

/// Resolve one decoded NDJSON line.
///
/// # Return value
///
/// - `Ok(Some(message))`: the line resolved to a known message.
/// - `Ok(None)`: the line is empty or whitespace.
///
/// # Errors
///
/// - [`AppError::MalformedMessage`] with kind `<invalid-json>` if the line is
///   not JSON, or with the message kind if required fields are missing.
/// - [`AppError::UnknownMessageKind`] for an unrecognised discriminator.
pub fn parse_line(line: &str) -> Result<Option<Message>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| AppError::MalformedMessage {
        kind: "<invalid-json>".into(),
        fields: vec![e.to_string()],
    })?;

    resolve(&value).map(Some)
}

/// Resolve a decoded JSON value into a [`Message`].
///
/// # Errors
///
/// See [`parse_line`].
pub fn resolve(value: &Value) -> Result<Message> {
    let Some(obj) = value.as_object() else {
        return Err(AppError::MalformedMessage {
            kind: "<non-object>".into(),
            fields: vec!["type".into()],
        });
    };

    let Some(kind) = obj.get("type").and_then(Value::as_str) else {
        return Err(AppError::MalformedMessage {
            kind: "<untyped>".into(),
            fields: vec!["type".into()],
        });
    };

    match kind {
        "system" => resolve_system(obj),
        "assistant" => resolve_turn(obj, "assistant").map(Message::AgentTurn),
        "user" => resolve_turn(obj, "user").map(Message::UserTurn),
        "stream_event" => resolve_stream_event(obj),
        "result" => resolve_result(obj),
        "control_response" => resolve_control_response(obj),
        "control_request" => resolve_control_request(obj),
        other => Err(AppError::UnknownMessageKind(other.to_owned())),
    }
}

// ── Field extraction ──────────────────────────────────────────────────────────

/// Collects the names of missing required fields while a message is resolved.
struct Fields {
    kind: &'static str,
    missing: Vec<String>,
}

impl Fields {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            missing: Vec::new(),
        }
    }

    fn string(&mut self, obj: &Map<String, Value>, name: &str, path: &str) -> Option<String> {
        let found = obj.get(name).and_then(Value::as_str).map(str::to_owned);
        if found.is_none() {
            self.missing.push(path.to_owned());
        }
        found
    }

    fn object<'a>(
        &mut self,
        obj: &'a Map<String, Value>,
        name: &str,
        path: &str,
    ) -> Option<&'a Map<String, Value>> {
        let found = obj.get(name).and_then(Value::as_object);
        if found.is_none() {
            self.missing.push(path.to_owned());
        }
        found
    }

    fn value<'a>(&mut self, obj: &'a Map<String, Value>, name: &str, path: &str) -> Option<&'a Value> {
        let found = obj.get(name).filter(|v| !v.is_null());
        if found.is_none() {
            self.missing.push(path.to_owned());
        }
        found
    }

    fn u64(&mut self, obj: &Map<String, Value>, name: &str, path: &str) -> Option<u64> {
        let found = obj.get(name).and_then(Value::as_u64);
        if found.is_none() {
            self.missing.push(path.to_owned());
        }
        found
    }

    fn into_error(self) -> AppError {
        AppError::MalformedMessage {
            kind: self.kind.to_owned(),
            fields: self.missing,
        }
    }
}

/// Optional string field; `null` and absence both map to `None`.
fn opt_string(obj: &Map<String, Value>, name: &str) -> Option<String> {
    obj.get(name).and_then(Value::as_str).map(str::to_owned)
}

// ── Per-kind resolution ───────────────────────────────────────────────────────

fn resolve_system(obj: &Map<String, Value>) -> Result<Message> {
    let mut fields = Fields::new("system");
    let Some(subtype) = fields.string(obj, "subtype", "subtype") else {
        return Err(fields.into_error());
    };

    if subtype != "init" {
        return Ok(Message::System {
            subtype,
            session_id: opt_string(obj, "session_id"),
            data: Value::Object(obj.clone()),
        });
    }

    let Some(session_id) = fields.string(obj, "session_id", "session_id") else {
        return Err(fields.into_error());
    };

    let tools = obj
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    Ok(Message::Init(InitMessage {
        session_id,
        model: opt_string(obj, "model"),
        cwd: opt_string(obj, "cwd"),
        tools,
        permission_mode: opt_string(obj, "permissionMode"),
        raw: Value::Object(obj.clone()),
    }))
}

fn resolve_turn(obj: &Map<String, Value>, kind: &'static str) -> Result<TurnMessage> {
    let mut fields = Fields::new(kind);
    let Some(message) = fields.object(obj, "message", "message") else {
        return Err(fields.into_error());
    };

    let content = match message.get("content") {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(blocks)) => resolve_blocks(blocks, &mut fields),
        _ => {
            fields.missing.push("message.content".into());
            Vec::new()
        }
    };

    if !fields.missing.is_empty() {
        return Err(fields.into_error());
    }

    Ok(TurnMessage {
        session_id: opt_string(obj, "session_id"),
        parent_tool_use_id: opt_string(obj, "parent_tool_use_id"),
        model: opt_string(message, "model"),
        content,
    })
}

fn resolve_blocks(blocks: &[Value], fields: &mut Fields) -> Vec<ContentBlock> {
    let mut resolved = Vec::with_capacity(blocks.len());

    for (i, block) in blocks.iter().enumerate() {
        let Some(block) = block.as_object() else {
            fields.missing.push(format!("message.content[{i}]"));
            continue;
        };
        let path = |name: &str| format!("message.content[{i}].{name}");

        let Some(block_type) = fields.string(block, "type", &path("type")) else {
            continue;
        };

        let parsed = match block_type.as_str() {
            "text" => fields
                .string(block, "text", &path("text"))
                .map(|text| ContentBlock::Text { text }),
            "thinking" => fields
                .string(block, "thinking", &path("thinking"))
                .map(|thinking| ContentBlock::Thinking {
                    thinking,
                    signature: opt_string(block, "signature"),
                    redacted: false,
                }),
            "redacted_thinking" => Some(ContentBlock::Thinking {
                thinking: String::new(),
                signature: opt_string(block, "data"),
                redacted: true,
            }),
            "tool_use" => {
                let id = fields.string(block, "id", &path("id"));
                let name = fields.string(block, "name", &path("name"));
                let input = fields.value(block, "input", &path("input"));
                match (id, name, input) {
                    (Some(id), Some(name), Some(input)) => Some(ContentBlock::ToolUse {
                        id,
                        name,
                        input: input.clone(),
                    }),
                    _ => None,
                }
            }
            "tool_result" => fields
                .string(block, "tool_use_id", &path("tool_use_id"))
                .map(|tool_use_id| ContentBlock::ToolResult {
                    tool_use_id,
                    content: block.get("content").cloned().unwrap_or(Value::Null),
                    is_error: block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }),
            _ => {
                fields.missing.push(path("type"));
                None
            }
        };

        if let Some(parsed) = parsed {
            resolved.push(parsed);
        }
    }

    resolved
}

fn resolve_stream_event(obj: &Map<String, Value>) -> Result<Message> {
    let mut fields = Fields::new("stream_event");
    let Some(event) = fields.object(obj, "event", "event") else {
        return Err(fields.into_error());
    };
    let Some(event_type) = fields.string(event, "type", "event.type") else {
        return Err(fields.into_error());
    };

    let session_id = opt_string(obj, "session_id");

    if event_type != "content_block_delta" {
        return Ok(Message::Delta(DeltaMessage {
            session_id,
            index: event.get("index").and_then(Value::as_u64),
            event_type,
            fragment: DeltaFragment::Event {
                event: Value::Object(event.clone()),
            },
        }));
    }

    let index = fields.u64(event, "index", "event.index");
    let delta = fields.object(event, "delta", "event.delta");
    let delta_type = delta.and_then(|d| fields.string(d, "type", "event.delta.type"));

    let (Some(index), Some(delta), Some(delta_type)) = (index, delta, delta_type) else {
        return Err(fields.into_error());
    };

    let fragment = match delta_type.as_str() {
        "text_delta" => fields
            .string(delta, "text", "event.delta.text")
            .map(|text| DeltaFragment::Text { text }),
        "thinking_delta" => fields
            .string(delta, "thinking", "event.delta.thinking")
            .map(|thinking| DeltaFragment::Thinking { thinking }),
        "input_json_delta" => fields
            .string(delta, "partial_json", "event.delta.partial_json")
            .map(|partial_json| DeltaFragment::InputJson { partial_json }),
        _ => Some(DeltaFragment::Event {
            event: Value::Object(event.clone()),
        }),
    };

    let Some(fragment) = fragment else {
        return Err(fields.into_error());
    };

    Ok(Message::Delta(DeltaMessage {
        session_id,
        event_type,
        index: Some(index),
        fragment,
    }))
}

fn resolve_result(obj: &Map<String, Value>) -> Result<Message> {
    let mut fields = Fields::new("result");
    let subtype = fields.string(obj, "subtype", "subtype");
    let session_id = fields.string(obj, "session_id", "session_id");

    let (Some(subtype), Some(session_id)) = (subtype, session_id) else {
        return Err(fields.into_error());
    };

    let status = if subtype == "success" {
        ResultStatus::Success
    } else {
        ResultStatus::Error(subtype)
    };
    let is_error = obj
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(status != ResultStatus::Success);

    Ok(Message::Result(ResultMessage {
        status,
        is_error,
        text: opt_string(obj, "result"),
        session_id,
        duration_ms: obj.get("duration_ms").and_then(Value::as_u64),
        duration_api_ms: obj.get("duration_api_ms").and_then(Value::as_u64),
        num_turns: obj.get("num_turns").and_then(Value::as_u64),
        total_cost_usd: obj.get("total_cost_usd").and_then(Value::as_f64),
        usage: obj.get("usage").filter(|v| !v.is_null()).cloned(),
    }))
}

fn resolve_control_response(obj: &Map<String, Value>) -> Result<Message> {
    let mut fields = Fields::new("control_response");
    let Some(response) = fields.object(obj, "response", "response") else {
        return Err(fields.into_error());
    };
    let subtype = fields.string(response, "subtype", "response.subtype");
    let request_id = fields.string(response, "request_id", "response.request_id");

    let (Some(subtype), Some(request_id)) = (subtype, request_id) else {
        return Err(fields.into_error());
    };

    let outcome = match subtype.as_str() {
        "success" => Ok(response.get("response").cloned().unwrap_or(Value::Null)),
        "error" => {
            let Some(error) = fields.string(response, "error", "response.error") else {
                return Err(fields.into_error());
            };
            Err(error)
        }
        _ => {
            fields.missing.push("response.subtype".into());
            return Err(fields.into_error());
        }
    };

    Ok(Message::ControlResponse(ControlResponseMessage {
        request_id,
        outcome,
    }))
}

fn resolve_control_request(obj: &Map<String, Value>) -> Result<Message> {
    let mut fields = Fields::new("control_request");
    let request_id = fields.string(obj, "request_id", "request_id");
    let request = fields.object(obj, "request", "request");
    let subtype = request.and_then(|r| fields.string(r, "subtype", "request.subtype"));

    let (Some(request_id), Some(request), Some(subtype)) = (request_id, request, subtype) else {
        return Err(fields.into_error());
    };

    Ok(Message::ControlRequest(ControlRequestMessage {
        request_id,
        subtype,
        request: Value::Object(request.clone()),
    }))
}
