// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::tool::Tool;

/// A tool schema – mirrors the model crate's shape but keeps the tools
/// crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Tools registered through [`register_infrastructure`] are used by the
/// core itself (summarization, delegation bookkeeping) and bypass the
/// approval gate by construction; session-level tools registered through
/// [`register`] consult it whenever they declare `requires_approval`.
///
/// [`register`]: ToolRegistry::register
/// [`register_infrastructure`]: ToolRegistry::register_infrastructure
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    infrastructure: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            infrastructure: HashSet::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Register a tool the core itself depends on; never approval-gated.
    pub fn register_infrastructure(&mut self, tool: impl Tool + 'static) {
        self.infrastructure.insert(tool.name().to_string());
        self.register(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_infrastructure(&self, name: &str) -> bool {
        self.infrastructure.contains(name)
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
