// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Folds a thread's event log into a provider-facing conversation.
//!
//! The fold enforces the provider schema: a tool result only appears with
//! its matching call, an unanswered call never goes out, and runtime-local
//! events (tokens, thinking markers, local system notices) stay out of the
//! request entirely.  Orphans remain in the event log untouched — dropping
//! them here is a view decision, not a rewrite.

use std::collections::HashSet;

use lace_model::Message;
use lace_store::{EventPayload, ThreadEvent};

/// Build the outgoing message list.  An empty event log yields an empty
/// request regardless of `system_prompt`.
pub fn build_conversation(system_prompt: Option<&str>, events: &[ThreadEvent]) -> Vec<Message> {
    if events.is_empty() {
        return Vec::new();
    }

    let mut calls: HashSet<&str> = HashSet::new();
    let mut results: HashSet<&str> = HashSet::new();
    for e in events {
        match &e.payload {
            EventPayload::ToolCall { call_id, .. } => {
                calls.insert(call_id.as_str());
            }
            EventPayload::ToolResult { call_id, .. } => {
                results.insert(call_id.as_str());
            }
            _ => {}
        }
    }

    let mut messages = Vec::with_capacity(events.len() + 1);
    if let Some(prompt) = system_prompt {
        messages.push(Message::system(prompt));
    }

    for e in events {
        match &e.payload {
            EventPayload::UserMessage { content } => messages.push(Message::user(content)),
            EventPayload::AgentMessage { content } => messages.push(Message::assistant(content)),
            EventPayload::ToolCall {
                tool_name,
                call_id,
                input,
            } => {
                if results.contains(call_id.as_str()) {
                    messages.push(Message::tool_call(call_id, tool_name, input.clone()));
                }
            }
            EventPayload::ToolResult {
                call_id,
                result,
                is_error,
                ..
            } => {
                if calls.contains(call_id.as_str()) {
                    messages.push(Message::tool_result(call_id, result, *is_error));
                }
            }
            EventPayload::CompactionSummary { summary, .. } => {
                messages.push(Message::assistant(summary.render()));
            }
            // Runtime-local events never reach the provider.
            EventPayload::AgentToken { .. }
            | EventPayload::Thinking { .. }
            | EventPayload::LocalSystemMessage { .. } => {}
        }
    }

    messages
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
