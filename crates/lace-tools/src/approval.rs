// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;

use async_trait::async_trait;

use crate::tool::{ToolCall, ToolContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// Injected capability consulted before dispatching a tool that declares
/// `requires_approval`.  Infrastructure tools registered through
/// `ToolRegistry::register_infrastructure` bypass the gate by construction.
///
/// Implementations must be non-blocking from the executor's point of view:
/// awaiting user input is fine (the agent suspends at this point), holding
/// locks across the await is not.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_approval(&self, call: &ToolCall, ctx: &ToolContext) -> ApprovalDecision;
}

/// Approves everything.  Default for headless runs.
pub struct ApproveAll;

#[async_trait]
impl ApprovalGate for ApproveAll {
    async fn request_approval(&self, _call: &ToolCall, _ctx: &ToolContext) -> ApprovalDecision {
        ApprovalDecision::Approve
    }
}

/// Denies everything.  Useful in tests and lockdown mode.
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn request_approval(&self, _call: &ToolCall, _ctx: &ToolContext) -> ApprovalDecision {
        ApprovalDecision::Deny
    }
}

/// Name-list policy: tools on the deny list are rejected, everything else
/// is approved.
pub struct ListPolicy {
    denied: HashSet<String>,
}

impl ListPolicy {
    pub fn denying(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            denied: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ApprovalGate for ListPolicy {
    async fn request_approval(&self, call: &ToolCall, _ctx: &ToolContext) -> ApprovalDecision {
        if self.denied.contains(&call.name) {
            ApprovalDecision::Deny
        } else {
            ApprovalDecision::Approve
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
