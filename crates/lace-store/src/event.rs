// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation thread: an append-only, totally ordered event sequence.
///
/// `canonical_id` is the user-visible identity that never changes; `id` is
/// the physical thread currently backing it (they differ once the thread has
/// been compacted at least once).
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub canonical_id: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub events: Vec<ThreadEvent>,
}

/// One immutable event in a thread.
///
/// `seq` is dense and strictly increasing per thread; it is the canonical
/// timeline, assigned by the store on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEvent {
    pub seq: i64,
    pub thread_id: String,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStatus {
    Start,
    Complete,
}

/// Event payloads, discriminated by a `type` tag so the on-disk JSON is
/// self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    UserMessage {
        content: String,
    },
    AgentMessage {
        content: String,
    },
    /// Streaming fragment.  Observable only; the runtime does not persist
    /// these, but the store accepts them on load for forward compatibility.
    AgentToken {
        token: String,
    },
    ToolCall {
        tool_name: String,
        call_id: String,
        input: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },
    Thinking {
        status: ThinkingStatus,
    },
    LocalSystemMessage {
        message: String,
    },
    /// Replaces a summarized event range during compaction.
    CompactionSummary {
        summary: CompactionDigest,
        /// Inclusive `[first_seq, last_seq]` of the replaced range in the
        /// previous physical thread.
        replaced_range: [i64; 2],
    },
}

impl EventPayload {
    pub fn user(content: impl Into<String>) -> Self {
        Self::UserMessage {
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::AgentMessage {
            content: content.into(),
        }
    }

    pub fn local_system(message: impl Into<String>) -> Self {
        Self::LocalSystemMessage {
            message: message.into(),
        }
    }

    pub fn tool_call(
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            tool_name: tool_name.into(),
            call_id: call_id.into(),
            input,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            result: result.into(),
            is_error,
        }
    }

    /// The stable type tag, as written to disk.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::AgentMessage { .. } => "agent_message",
            Self::AgentToken { .. } => "agent_token",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Thinking { .. } => "thinking",
            Self::LocalSystemMessage { .. } => "local_system_message",
            Self::CompactionSummary { .. } => "compaction_summary",
        }
    }

    /// True for the conversational message kinds (user/agent text).
    pub fn is_message(&self) -> bool {
        matches!(self, Self::UserMessage { .. } | Self::AgentMessage { .. })
    }

    /// The tool call id this event participates in, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call_id, .. } | Self::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Rough token cost of this event (4 chars ≈ 1 token), used by the
    /// budget manager when the provider has no proactive counter.
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::UserMessage { content } | Self::AgentMessage { content } => content.len(),
            Self::AgentToken { token } => token.len(),
            Self::ToolCall {
                tool_name, input, ..
            } => tool_name.len() + input.to_string().len(),
            Self::ToolResult { result, .. } => result.len(),
            Self::Thinking { .. } => 0,
            Self::LocalSystemMessage { message } => message.len(),
            Self::CompactionSummary { summary, .. } => summary.render().len(),
        };
        (chars / 4).max(1)
    }
}

/// Structured digest of a summarized event range.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactionDigest {
    /// Number of summarized events per type tag.
    pub event_counts: BTreeMap<String, usize>,
    /// Tools invoked in the summarized range, with call counts.
    pub tools_used: BTreeMap<String, usize>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl CompactionDigest {
    /// Human/model-readable rendering injected into rebuilt conversations.
    pub fn render(&self) -> String {
        let mut out = String::from("[Earlier conversation compacted");
        let total: usize = self.event_counts.values().sum();
        out.push_str(&format!(": {total} events"));
        if !self.event_counts.is_empty() {
            let parts: Vec<String> = self
                .event_counts
                .iter()
                .map(|(k, v)| format!("{v} {k}"))
                .collect();
            out.push_str(&format!(" ({})", parts.join(", ")));
        }
        if !self.tools_used.is_empty() {
            let parts: Vec<String> = self
                .tools_used
                .iter()
                .map(|(k, v)| format!("{k}×{v}"))
                .collect();
            out.push_str(&format!("; tools: {}", parts.join(", ")));
        }
        if let (Some(first), Some(last)) = (self.first_timestamp, self.last_timestamp) {
            out.push_str(&format!(
                "; spanning {} – {}",
                first.format("%Y-%m-%d %H:%M:%S"),
                last.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        out.push(']');
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
