// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the provider-facing conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

/// The content of a message.
///
/// - `Text` – plain string (most messages)
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the result of a tool call, paired by `call_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        call_id: String,
        name: String,
        /// Parsed JSON argument object
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            },
        }
    }

    /// Return the plain text of this message, if it is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Approximate token count used for context budgeting.
    ///
    /// Uses the 4-chars-per-token heuristic; the budget manager prefers the
    /// provider's own counter when one is available.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ToolCall {
                name, arguments, ..
            } => name.len() + arguments.to_string().len(),
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        (chars / 4).max(1)
    }
}

// ─── Provider request / response ──────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A tool invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments.  May be syntactically incomplete when the stream
    /// stopped on `max_tokens`; callers must validate before dispatch.
    pub arguments: serde_json::Value,
}

/// Why a generation terminated.
///
/// Any wire value outside this set is normalized to `EndTurn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Error,
}

impl StopReason {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "max_tokens" | "length" => Self::MaxTokens,
            "tool_use" | "tool_calls" => Self::ToolUse,
            "stop_sequence" => Self::StopSequence,
            "error" => Self::Error,
            _ => Self::EndTurn,
        }
    }
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Non-streaming completion result.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text fragment.
    TokenDelta(String),
    /// A fragment of a tool call.  Providers interleave fragments for
    /// parallel calls by `index`; `id`/`name` arrive once, `arguments`
    /// accumulates across deltas.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Terminal event of every stream.
    Final {
        stop_reason: StopReason,
        usage: Usage,
    },
}

/// A model advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub context_window: usize,
    pub max_output_tokens: usize,
}

/// Assembles [`StreamEvent::ToolCallDelta`] fragments into complete
/// [`ToolCallRequest`]s.
///
/// Providers interleave fragments for parallel tool calls by `index`; the
/// `id` and `name` arrive once per call while `arguments` accumulates as a
/// JSON string across deltas.  `finish` parses the buffers, substituting an
/// empty object for arguments that never became valid JSON (the stop-reason
/// repair path in the runtime drops those calls before dispatch).
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: std::collections::BTreeMap<u32, (String, String, String)>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, index: u32, id: String, name: String, arguments: String) {
        let entry = self.pending.entry(index).or_default();
        if !id.is_empty() {
            entry.0 = id;
        }
        if !name.is_empty() {
            entry.1 = name;
        }
        entry.2.push_str(&arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.pending
            .into_values()
            .filter(|(_, name, _)| !name.is_empty())
            .enumerate()
            .map(|(i, (id, name, args_buf))| {
                let arguments = if args_buf.is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_str(&args_buf)
                        .unwrap_or(serde_json::Value::Object(Default::default()))
                };
                let id = if id.is_empty() {
                    format!("call_synthetic_{i}")
                } else {
                    id
                };
                ToolCallRequest {
                    id,
                    name,
                    arguments,
                }
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::tool_result("id", "out", false).role, Role::Tool);
    }

    #[test]
    fn as_text_only_for_text_content() {
        assert_eq!(Message::user("hi").as_text(), Some("hi"));
        assert!(Message::tool_result("id", "out", false).as_text().is_none());
        let tc = Message::tool_call("id", "f", serde_json::json!({}));
        assert!(tc.as_text().is_none());
    }

    #[test]
    fn approx_tokens_divides_by_four_with_floor_one() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
        assert_eq!(Message::user("hi").approx_tokens(), 1);
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_tool_call_counts_name_and_args() {
        let m = Message::tool_call("id", "aaaa", serde_json::json!({"k": "val"}));
        // 4 (name) + len of {"k":"val"} = 11 → 15 chars → 3 tokens
        assert_eq!(m.approx_tokens(), 3);
    }

    #[test]
    fn stop_reason_wire_mapping() {
        assert_eq!(StopReason::from_wire("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::from_wire("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::from_wire("length"), StopReason::MaxTokens);
        assert_eq!(StopReason::from_wire("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::from_wire("tool_calls"), StopReason::ToolUse);
        assert_eq!(
            StopReason::from_wire("stop_sequence"),
            StopReason::StopSequence
        );
        assert_eq!(StopReason::from_wire("error"), StopReason::Error);
    }

    #[test]
    fn unknown_stop_reason_becomes_end_turn() {
        assert_eq!(StopReason::from_wire("content_filter"), StopReason::EndTurn);
        assert_eq!(StopReason::from_wire(""), StopReason::EndTurn);
    }

    #[test]
    fn accumulator_merges_fragments_by_index() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, "c1".into(), "alpha".into(), r#"{"a""#.into());
        acc.push(1, "c2".into(), "beta".into(), r#"{"b":2}"#.into());
        acc.push(0, String::new(), String::new(), r#":1}"#.into());
        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "alpha");
        assert_eq!(calls[0].arguments, serde_json::json!({"a": 1}));
        assert_eq!(calls[1].name, "beta");
    }

    #[test]
    fn accumulator_drops_nameless_calls() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, "c1".into(), String::new(), "{}".into());
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn accumulator_substitutes_object_for_bad_json() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, "c1".into(), "f".into(), r#"{"truncat"#.into());
        let calls = acc.finish();
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn accumulator_generates_synthetic_id_when_missing() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, String::new(), "f".into(), "{}".into());
        let calls = acc.finish();
        assert!(calls[0].id.starts_with("call_synthetic_"));
    }

    #[test]
    fn message_serializes_and_deserializes() {
        let original = Message::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.as_text(), Some("test payload"));
    }
}
