// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::types::ToolCallAccumulator;
use crate::{ChatRequest, ChatResponse, Message, ModelDescriptor, StopReason, StreamEvent, Usage};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Capability interface the conversation core consumes.
///
/// The wire protocol behind an implementation is out of scope here; the core
/// only relies on this contract.  `count_tokens` is optional — providers
/// without a local tokenizer return `None` and the budget manager falls back
/// to a character heuristic.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// List all models available from this provider.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        Ok(vec![])
    }

    /// Proactive token counting.  `None` when the provider cannot count
    /// without a network round-trip.
    fn count_tokens(&self, _messages: &[Message]) -> Option<usize> {
        None
    }

    /// Send a completion request and return a streaming response.
    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream>;

    /// Non-streaming completion.
    ///
    /// The default implementation drains `chat_stream`, assembling deltas
    /// into a [`ChatResponse`].  Providers with a cheaper non-streaming
    /// endpoint may override.
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let mut stream = self.chat_stream(req).await?;
        let mut content = String::new();
        let mut pending = ToolCallAccumulator::default();
        let mut stop_reason = StopReason::EndTurn;
        let mut usage = Usage::default();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TokenDelta(t) => content.push_str(&t),
                StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                } => pending.push(index, id, name, arguments),
                StreamEvent::Final {
                    stop_reason: sr,
                    usage: u,
                } => {
                    stop_reason = sr;
                    usage = u;
                }
            }
        }

        Ok(ChatResponse {
            content,
            tool_calls: pending.finish(),
            stop_reason,
            usage,
        })
    }
}
