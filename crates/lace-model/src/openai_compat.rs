// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion transport.
//!
//! Most hosted and local model servers (OpenAI, Groq, OpenRouter, Ollama,
//! llama.cpp, vLLM, LiteLLM) speak the same `/chat/completions` SSE wire
//! format, so a single provider covers all of them.  Servers without
//! authentication simply leave the API key unset.

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use lace_config::ModelConfig;

use crate::{
    provider::EventStream, ChatRequest, Message, MessageContent, ModelDescriptor, Role,
    StopReason, StreamEvent, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatProvider {
    model: String,
    /// API key (pre-resolved from config or env).  `None` for local servers.
    api_key: Option<String>,
    chat_url: String,
    models_url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Self> {
        let api_key = cfg.api_key.clone().or_else(|| {
            cfg.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        });
        let base = cfg
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            model: cfg.name.clone(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: format!("{base}/models"),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            client: reqwest::Client::new(),
        })
    }

    fn request_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages = build_wire_messages(&req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(mt) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    /// List models via `GET /models`.  Context window metadata is not part
    /// of this wire format, so descriptors carry zeroes and the configured
    /// window applies.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        let resp = self
            .authorize(self.client.get(&self.models_url))
            .send()
            .await
            .context("listing models")?;
        if !resp.status().is_success() {
            anyhow::bail!("model list request failed: {}", resp.status());
        }
        let body: Value = resp.json().await.context("decoding model list")?;
        let mut entries = Vec::new();
        if let Some(data) = body["data"].as_array() {
            for item in data {
                if let Some(id) = item["id"].as_str() {
                    entries.push(ModelDescriptor {
                        id: id.to_string(),
                        context_window: 0,
                        max_output_tokens: 0,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        let body = self.request_body(&req, true);
        debug!(
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let resp = self
            .authorize(self.client.post(&self.chat_url).json(&body))
            .send()
            .await
            .context("sending completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        // finish_reason and usage arrive in chunks before the `[DONE]`
        // sentinel, so the parse state carries them until the terminal
        // Final event is emitted.
        let event_stream = byte_stream
            .scan(SseState::default(), |state, chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        state.buf.push_str(&String::from_utf8_lossy(&b));
                        state.drain_complete_lines()
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Incremental SSE parse state carried across TCP chunks.
#[derive(Default)]
struct SseState {
    buf: String,
    stop_reason: Option<StopReason>,
    usage: Usage,
    done: bool,
}

impl SseState {
    /// Drain all complete `\n`-terminated SSE lines from the buffer.
    ///
    /// Any trailing incomplete line is left in place so it can be extended
    /// by the next TCP chunk.
    fn drain_complete_lines(&mut self) -> Vec<anyhow::Result<StreamEvent>> {
        let mut events = Vec::new();
        while let Some(nl_pos) = self.buf.find('\n') {
            let line = self.buf[..nl_pos].trim_end_matches('\r').to_string();
            self.buf = self.buf[nl_pos + 1..].to_string();
            self.parse_data_line(&line, &mut events);
        }
        events
    }

    fn parse_data_line(&mut self, line: &str, events: &mut Vec<anyhow::Result<StreamEvent>>) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || self.done {
            return;
        }
        if data == "[DONE]" {
            self.done = true;
            events.push(Ok(StreamEvent::Final {
                stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                usage: self.usage,
            }));
            return;
        }
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping malformed SSE frame");
                return;
            }
        };

        // Usage-only chunk (emitted when stream_options.include_usage = true)
        if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
            self.usage = Usage {
                input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
            };
        }

        let Some(choice) = value["choices"].get(0) else {
            return;
        };
        if let Some(fr) = choice["finish_reason"].as_str() {
            self.stop_reason = Some(StopReason::from_wire(fr));
        }
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::TokenDelta(text.to_string())));
            }
        }
        if let Some(tcs) = delta["tool_calls"].as_array() {
            for tc in tcs {
                events.push(Ok(StreamEvent::ToolCallDelta {
                    index: tc["index"].as_u64().unwrap_or(0) as u32,
                    id: tc["id"].as_str().unwrap_or("").to_string(),
                    name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                    arguments: tc["function"]["arguments"]
                        .as_str()
                        .unwrap_or("")
                        .to_string(),
                }));
            }
        }
    }
}

/// Serialize conversation messages into the OpenAI wire shape.
fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(t) => json!({
                "role": wire_role(m.role),
                "content": t,
            }),
            MessageContent::ToolCall {
                call_id,
                name,
                arguments,
            } => json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": call_id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments.to_string() },
                }],
            }),
            MessageContent::ToolResult {
                call_id, content, ..
            } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": content,
            }),
        })
        .collect()
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
