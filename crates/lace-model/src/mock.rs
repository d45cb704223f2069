// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::EventStream, ChatRequest, Message, Role, StopReason, StreamEvent, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TokenDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Final {
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                },
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `chat_stream` pops the next
/// response script from the front of the queue.  This lets tests specify
/// exact event sequences – including tool calls and stop reasons – without
/// network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// When true, `count_tokens` returns the chars/4 estimate so budget
    /// tests exercise the proactive-counting path.
    proactive_counting: bool,
    /// The last `ChatRequest` seen by this provider.
    /// Written on each `chat_stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
    /// Number of completed `chat_stream()` calls.
    pub call_count: Arc<Mutex<usize>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`StreamEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            proactive_counting: false,
            last_request: Arc::new(Mutex::new(None)),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Enable proactive token counting (chars/4) for budget-path tests.
    pub fn with_proactive_counting(mut self) -> Self {
        self.proactive_counting = true;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            StreamEvent::TokenDelta(r),
            StreamEvent::Final {
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                },
            },
        ]])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            // Round 1 – model emits a tool call
            vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: call_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamEvent::Final {
                    stop_reason: StopReason::ToolUse,
                    usage: Usage::default(),
                },
            ],
            // Round 2 – model responds after the tool result
            vec![
                StreamEvent::TokenDelta(final_text.into()),
                StreamEvent::Final {
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::default(),
                },
            ],
        ])
    }

    /// Convenience script fragment: a final event with the given stop reason.
    pub fn final_event(stop_reason: StopReason) -> StreamEvent {
        StreamEvent::Final {
            stop_reason,
            usage: Usage::default(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn count_tokens(&self, messages: &[Message]) -> Option<usize> {
        if self.proactive_counting {
            Some(messages.iter().map(|m| m.approx_tokens()).sum())
        } else {
            None
        }
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.call_count.lock().unwrap() += 1;
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    StreamEvent::TokenDelta("[no more scripts]".into()),
                    StreamEvent::Final {
                        stop_reason: StopReason::EndTurn,
                        usage: Usage::default(),
                    },
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
