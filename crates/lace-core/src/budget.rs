// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use lace_config::BudgetConfig;
use lace_model::{Message, ModelProvider};

/// Token budget accounting for one agent.
///
/// The allowed input is `context_window - response_reserve`.  Crossing
/// `warn_fraction` of that emits a warning; reaching it blocks the dispatch
/// and forces compaction.  Estimation prefers the provider's own counter
/// and falls back to the 4-chars-per-token heuristic.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    context_window: usize,
    response_reserve: usize,
    warn_fraction: f32,
    total_input: u64,
    total_output: u64,
}

impl TokenBudget {
    pub fn new(context_window: usize, cfg: &BudgetConfig) -> Self {
        Self {
            context_window,
            response_reserve: cfg.response_reserve,
            warn_fraction: cfg.warn_fraction,
            total_input: 0,
            total_output: 0,
        }
    }

    /// Tokens available for the request body.
    pub fn allowed_input(&self) -> usize {
        self.context_window.saturating_sub(self.response_reserve)
    }

    /// Estimate the token cost of a provider request.
    pub fn estimate(&self, provider: &dyn ModelProvider, messages: &[Message]) -> usize {
        provider
            .count_tokens(messages)
            .unwrap_or_else(|| messages.iter().map(|m| m.approx_tokens()).sum())
    }

    pub fn should_warn(&self, estimated: usize) -> bool {
        let allowed = self.allowed_input();
        if allowed == 0 {
            return true;
        }
        (estimated as f32 / allowed as f32) >= self.warn_fraction
    }

    pub fn should_block(&self, estimated: usize) -> bool {
        estimated >= self.allowed_input()
    }

    /// Record reactive usage reported by the provider.
    pub fn record_usage(&mut self, input_tokens: u32, output_tokens: u32) {
        self.total_input += input_tokens as u64;
        self.total_output += output_tokens as u64;
    }

    pub fn reset(&mut self) {
        self.total_input = 0;
        self.total_output = 0;
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.total_input, self.total_output)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
