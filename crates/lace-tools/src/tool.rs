// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCategory, ToolError};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON input
    pub input: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Per-call environment handed to every tool execution.
///
/// `sandbox` is an opaque container-runtime handle owned by the host
/// process; the executor never inspects it.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub thread_id: String,
    pub session_id: String,
    pub agent_name: String,
    pub working_directory: PathBuf,
    pub process_env: HashMap<String, String>,
    /// Cancels the whole turn; tools should return promptly once triggered.
    pub signal: CancellationToken,
    pub sandbox: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("thread_id", &self.thread_id)
            .field("session_id", &self.session_id)
            .field("agent_name", &self.agent_name)
            .field("working_directory", &self.working_directory)
            .field("sandbox", &self.sandbox.is_some())
            .finish()
    }
}

/// Execution metadata attached to every result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMetadata {
    /// Failure category; `None` on success.
    pub category: Option<ErrorCategory>,
    /// Suggested remediation for the failure.
    pub remediation: Option<String>,
    /// Hint for when a retry is worthwhile (rate limits, open circuits).
    pub retry_after: Option<Duration>,
    /// How many retries the executor performed before this result.
    pub retry_attempts: u32,
    /// True when the call ran in the per-batch sequential fallback pass.
    pub sequential_fallback: bool,
}

/// The outcome of executing a tool call.  Failures are values, not panics:
/// an `is_error` result becomes a `tool_result` event and the turn goes on.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
    pub metadata: ResultMetadata,
}

impl ToolResult {
    /// Successful result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            metadata: ResultMetadata::default(),
        }
    }

    /// Failure result carrying the error's category and remediation so the
    /// model (and the user) can act on it.
    pub fn from_error(call_id: impl Into<String>, err: &ToolError) -> Self {
        Self {
            call_id: call_id.into(),
            content: err.to_string(),
            is_error: true,
            metadata: ResultMetadata {
                category: Some(err.category()),
                remediation: Some(err.remediation().to_string()),
                retry_after: err.retry_after(),
                ..Default::default()
            },
        }
    }
}

/// Trait implemented by every tool the executor can dispatch.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-Schema-shaped declarative contract for `input`.
    fn input_schema(&self) -> Value;
    /// Whether the approval gate must be consulted before dispatch.
    fn requires_approval(&self) -> bool {
        false
    }
    /// Run the tool.  Failures are returned as [`ToolError`] values so the
    /// executor can classify, retry, and report them.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<String, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
