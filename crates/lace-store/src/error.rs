// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed (constraint violation, corruption, I/O).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// A persisted event payload failed to decode.
    #[error("corrupt event payload in thread {thread_id} at seq {seq}: {source}")]
    CorruptEvent {
        thread_id: String,
        seq: i64,
        source: serde_json::Error,
    },

    /// Rejected state change (task status closure, agent lifecycle rules).
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("schema migration {version} failed: {message}")]
    Migration { version: i64, message: String },
}
