// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Event-sourced persistence for conversation threads, tasks, and agents.
//!
//! A thread is an append-only, totally ordered sequence of immutable events
//! in a single SQLite file.  Compaction never rewrites history: it creates a
//! new physical thread ("shadow") and swaps the canonical → current-version
//! mapping, so external references stay stable forever.

pub mod db;
pub mod error;
pub mod event;
pub mod tasks;
pub mod threads;

pub use db::{AgentKind, AgentMeta, AgentState, Database, VersionRecord};
pub use error::{Result, StoreError};
pub use event::{CompactionDigest, EventPayload, ThinkingStatus, Thread, ThreadEvent};
pub use tasks::{NewTask, Task, TaskNote, TaskPriority, TaskStatus};
pub use threads::ThreadStore;
