// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should default to enabled need a named
/// function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai-compat" for any `/chat/completions`
    /// endpoint, "mock" for the deterministic test provider.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local servers (Ollama, llama.cpp,
    /// LiteLLM) or proxies.
    pub base_url: Option<String>,
    /// Context window of the model, in tokens.
    #[serde(default = "ModelConfig::default_context_window")]
    pub context_window: usize,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

impl ModelConfig {
    fn default_context_window() -> usize {
        128_000
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai-compat".into(),
            name: "gpt-4o-mini".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
            api_key: None,
            base_url: None,
            context_window: Self::default_context_window(),
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model ↔ tool rounds within one turn before the loop is cut off.
    #[serde(default = "AgentConfig::default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Optional overall deadline for one turn (provider + tool phases), seconds.
    #[serde(default)]
    pub turn_timeout_secs: Option<u64>,
}

impl AgentConfig {
    fn default_max_tool_rounds() -> u32 {
        32
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: Self::default_max_tool_rounds(),
            turn_timeout_secs: None,
        }
    }
}

/// Token budget policy: allowed input is `context_window - response_reserve`;
/// `warn_fraction` of that emits a warning, 100% blocks and forces compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Tokens held back for the model's response.
    #[serde(default = "BudgetConfig::default_response_reserve")]
    pub response_reserve: usize,
    /// Fraction of the allowed input at which a warning is emitted (0.0–1.0).
    #[serde(default = "BudgetConfig::default_warn_fraction")]
    pub warn_fraction: f32,
}

impl BudgetConfig {
    fn default_response_reserve() -> usize {
        4096
    }
    fn default_warn_fraction() -> f32 {
        0.8
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            response_reserve: Self::default_response_reserve(),
            warn_fraction: Self::default_warn_fraction(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategyKind {
    /// Replace old events with a structured digest event.
    #[default]
    Summarize,
    /// Drop old events outright, keeping only the recent tail.
    Truncate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub strategy: CompactionStrategyKind,
    /// How many trailing message events survive compaction verbatim.
    #[serde(default = "CompactionConfig::default_preserve_recent_events")]
    pub preserve_recent_events: usize,
    /// Keep every user message regardless of age.
    #[serde(default = "default_true")]
    pub preserve_user_messages: bool,
    /// How many superseded shadow threads to retain on cleanup.
    #[serde(default = "CompactionConfig::default_keep_shadows")]
    pub keep_shadows: usize,
}

impl CompactionConfig {
    fn default_preserve_recent_events() -> usize {
        10
    }
    fn default_keep_shadows() -> usize {
        3
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategyKind::default(),
            preserve_recent_events: Self::default_preserve_recent_events(),
            preserve_user_messages: true,
            keep_shadows: Self::default_keep_shadows(),
        }
    }
}

/// Tool executor limits: concurrency, retry backoff, and the per-tool
/// circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "ExecutorConfig::default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    #[serde(default = "ExecutorConfig::default_max_retries")]
    pub max_retries: u32,
    /// Base delay of the exponential backoff, milliseconds.
    #[serde(default = "ExecutorConfig::default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "ExecutorConfig::default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Upper bound for one backoff delay, milliseconds.
    #[serde(default = "ExecutorConfig::default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Consecutive failures that open a tool's circuit.
    #[serde(default = "ExecutorConfig::default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing, milliseconds.
    #[serde(default = "ExecutorConfig::default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Probe calls admitted while half-open.
    #[serde(default = "ExecutorConfig::default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Per-tool execution timeout, seconds.  0 disables the timeout.
    #[serde(default = "ExecutorConfig::default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl ExecutorConfig {
    fn default_max_concurrent_tools() -> usize {
        4
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_base_ms() -> u64 {
        200
    }
    fn default_retry_multiplier() -> f64 {
        2.0
    }
    fn default_retry_max_delay_ms() -> u64 {
        30_000
    }
    fn default_failure_threshold() -> u32 {
        5
    }
    fn default_open_timeout_ms() -> u64 {
        30_000
    }
    fn default_half_open_max_calls() -> u32 {
        1
    }
    fn default_tool_timeout_secs() -> u64 {
        120
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tools: Self::default_max_concurrent_tools(),
            max_retries: Self::default_max_retries(),
            retry_base_ms: Self::default_retry_base_ms(),
            retry_multiplier: Self::default_retry_multiplier(),
            retry_max_delay_ms: Self::default_retry_max_delay_ms(),
            failure_threshold: Self::default_failure_threshold(),
            open_timeout_ms: Self::default_open_timeout_ms(),
            half_open_max_calls: Self::default_half_open_max_calls(),
            tool_timeout_secs: Self::default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued messages per agent.  On overflow the oldest
    /// normal-priority message is dropped.
    #[serde(default = "QueueConfig::default_capacity")]
    pub capacity: usize,
}

impl QueueConfig {
    fn default_capacity() -> usize {
        100
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.  Defaults to
    /// `$XDG_DATA_HOME/lace/lace.db` when unset.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the effective database path.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(p) = &self.db_path {
            return p.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lace")
            .join("lace.db")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
