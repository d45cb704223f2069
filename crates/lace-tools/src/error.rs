// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Failure taxonomy for tool execution.
///
/// Only `Network`, `RateLimit`, and `Timeout` are retriable; everything
/// else fails immediately.  `RateLimit` additionally counts as an overload
/// signal, which is what triggers the executor's sequential fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("cancelled")]
    Cancelled,

    #[error("circuit open for tool '{tool}'")]
    CircuitBroken {
        tool: String,
        retry_after: Duration,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    RateLimit,
    Network,
    Timeout,
    Validation,
    Permission,
    Auth,
    Cancelled,
    CircuitBroken,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::Auth => "auth",
            Self::Cancelled => "cancelled",
            Self::CircuitBroken => "circuit_broken",
            Self::Unknown => "unknown",
        }
    }
}

impl ToolError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidInput(_) => ErrorCategory::Validation,
            Self::Network(_) => ErrorCategory::Network,
            Self::RateLimit { .. } => ErrorCategory::RateLimit,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::PermissionDenied(_) => ErrorCategory::Permission,
            Self::AuthRequired(_) => ErrorCategory::Auth,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::CircuitBroken { .. } => ErrorCategory::CircuitBroken,
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimit { .. } | Self::Timeout(_)
        )
    }

    /// Overload signals trigger the batch-level sequential fallback.
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    /// Suggested next step, surfaced in the result metadata.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "fix the tool input to match the declared schema",
            Self::Network(_) => "check connectivity and retry",
            Self::RateLimit { .. } => "wait for the rate limit window, then retry",
            Self::Timeout(_) => "retry, or increase the tool timeout",
            Self::PermissionDenied(_) => "request approval or use a permitted tool",
            Self::AuthRequired(_) => "provide credentials for this tool",
            Self::Cancelled => "the turn was cancelled; re-submit to continue",
            Self::CircuitBroken { .. } => "the tool is failing repeatedly; retry after the circuit closes",
            Self::Other(_) => "inspect the error message and retry if transient",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            Self::CircuitBroken { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
