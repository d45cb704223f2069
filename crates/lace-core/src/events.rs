// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde_json::Value;

/// Turn states of the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Thinking,
    Streaming,
    ToolExecution,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Streaming => "streaming",
            Self::ToolExecution => "tool_execution",
        }
    }
}

/// Events emitted by an agent during a single turn.
/// Consumers (CLI, tests, future UIs) subscribe to these to drive output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The runtime state machine moved
    StateChange { from: TurnState, to: TurnState },
    /// A text fragment streamed from the model
    TokenDelta(String),
    /// A complete assistant message (after streaming finishes)
    MessageComplete(String),
    /// The model requested a tool call
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Input crossed the warn threshold of the token budget
    BudgetWarning { estimated: usize, allowed: usize },
    /// The model stopped on max_tokens; incomplete tool calls were dropped
    TokenExhaustion { dropped_calls: usize },
    /// The thread was compacted into a new physical thread
    Compacted {
        events_before: usize,
        events_after: usize,
        new_thread_id: String,
    },
    /// The agent finished the current turn (and any queued follow-ups)
    TurnComplete,
    /// The turn was cancelled; any streamed text is carried along
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
}

/// Kinds of events on the session-wide activity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    StateChange,
    MessageQueued,
    Token,
    Message,
    ToolCall,
    ToolResult,
    TokenBudgetWarning,
    TokenExhaustion,
    Compaction,
    CircuitOpen,
    CircuitClose,
    Retry,
    QueueOverflow,
    QueueProcessingStart,
    QueueProcessingComplete,
    QueueCleared,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChange => "state_change",
            Self::MessageQueued => "message_queued",
            Self::Token => "token",
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::TokenBudgetWarning => "token_budget_warning",
            Self::TokenExhaustion => "token_exhaustion",
            Self::Compaction => "compaction",
            Self::CircuitOpen => "circuit_open",
            Self::CircuitClose => "circuit_close",
            Self::Retry => "retry",
            Self::QueueOverflow => "queue_overflow",
            Self::QueueProcessingStart => "queue_processing_start",
            Self::QueueProcessingComplete => "queue_processing_complete",
            Self::QueueCleared => "queue_cleared",
        }
    }
}

/// One observable runtime event: a kind, the thread it concerns, a
/// timestamp, and a kind-specific JSON payload.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub thread_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: Value,
}

impl ActivityEvent {
    pub fn new(kind: ActivityKind, thread_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            thread_id: thread_id.into(),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }
}

/// Helper for serializing durations into activity payloads.
pub(crate) fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
