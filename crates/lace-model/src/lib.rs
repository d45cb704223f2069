// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod mock;
pub mod openai_compat;
pub mod provider;
pub mod types;

pub use mock::{MockProvider, ScriptedProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{EventStream, ModelProvider};
pub use types::{
    ChatRequest, ChatResponse, Message, MessageContent, ModelDescriptor, Role, StopReason,
    StreamEvent, ToolCallAccumulator, ToolCallRequest, ToolSchema, Usage,
};

use std::sync::Arc;

use lace_config::ModelConfig;

/// Build a provider from configuration.
///
/// `"mock"` resolves to the deterministic echo provider (used by tests and
/// dry runs); anything else is treated as an OpenAI-compatible endpoint.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(MockProvider)),
        _ => Ok(Arc::new(OpenAiCompatProvider::from_config(cfg)?)),
    }
}
