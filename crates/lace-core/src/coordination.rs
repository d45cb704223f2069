// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session-level tools for multi-agent coordination: the task table
//! (create / list / update / note) and the delegate tool that spawns an
//! ephemeral agent for a focused job.
//!
//! The delegate tool is deliberately absent from the registries it builds
//! for its sub-agents, so an ephemeral agent can never spawn further
//! agents.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use lace_config::Config;
use lace_model::ModelProvider;
use lace_store::{Database, NewTask, TaskPriority, TaskStatus};
use lace_tools::{
    ApprovalGate, Tool, ToolContext, ToolError, ToolExecutor, ToolRegistry,
};

use crate::{
    agent::Agent,
    budget::TokenBudget,
    compact::strategy_from_config,
    events::AgentEvent,
    queue::MessageQueue,
    session::SessionManager,
};

/// Registry of the coordination tools every agent gets.  The delegate tool
/// is added separately and only for persistent agents.
pub fn coordination_registry(db: Arc<Database>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(TaskCreateTool { db: db.clone() });
    registry.register(TaskListTool { db: db.clone() });
    registry.register(TaskUpdateTool { db: db.clone() });
    registry.register(TaskNoteTool { db });
    registry
}

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    input[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidInput(format!("missing '{key}'")))
}

fn store_err(e: impl std::fmt::Display) -> ToolError {
    ToolError::Other(e.to_string())
}

// ─── Task tools ───────────────────────────────────────────────────────────────

pub struct TaskCreateTool {
    db: Arc<Database>,
}

#[async_trait]
impl Tool for TaskCreateTool {
    fn name(&self) -> &str {
        "task_create"
    }
    fn description(&self) -> &str {
        "Create a task in the session's shared task list. Assign it to an \
         agent by name, or to 'new:<provider>/<model>' to request a fresh \
         ephemeral agent for it."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "description": { "type": "string" },
                "prompt": { "type": "string", "description": "Detailed instructions for the executing agent" },
                "priority": { "type": "string", "enum": ["high", "medium", "low"] },
                "assigned_to": { "type": "string" },
            },
            "required": ["title"]
        })
    }
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let priority = match input["priority"].as_str() {
            Some(p) => Some(
                TaskPriority::parse(p)
                    .ok_or_else(|| ToolError::InvalidInput(format!("bad priority: {p}")))?,
            ),
            None => None,
        };
        let task = self
            .db
            .create_task(
                &ctx.session_id,
                &ctx.agent_name,
                NewTask {
                    title: required_str(&input, "title")?.to_string(),
                    description: input["description"].as_str().unwrap_or("").to_string(),
                    prompt: input["prompt"].as_str().unwrap_or("").to_string(),
                    priority,
                    assigned_to: input["assigned_to"].as_str().map(str::to_string),
                },
            )
            .map_err(store_err)?;
        Ok(format!("created {} ({})", task.id, task.title))
    }
}

pub struct TaskListTool {
    db: Arc<Database>,
}

#[async_trait]
impl Tool for TaskListTool {
    fn name(&self) -> &str {
        "task_list"
    }
    fn description(&self) -> &str {
        "List tasks: scope 'mine' shows tasks assigned to you, 'session' \
         shows the whole session's tasks."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "scope": { "type": "string", "enum": ["mine", "session"] },
            }
        })
    }
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let tasks = match input["scope"].as_str().unwrap_or("session") {
            "mine" => self
                .db
                .list_tasks_for_assignee(&ctx.agent_name)
                .map_err(store_err)?,
            _ => self
                .db
                .list_session_tasks(&ctx.session_id)
                .map_err(store_err)?,
        };
        if tasks.is_empty() {
            return Ok("no tasks".into());
        }
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| {
                format!(
                    "{} [{}|{}] {} (assigned: {})",
                    t.id,
                    t.status.as_str(),
                    t.priority.as_str(),
                    t.title,
                    t.assigned_to.as_deref().unwrap_or("-")
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

pub struct TaskUpdateTool {
    db: Arc<Database>,
}

#[async_trait]
impl Tool for TaskUpdateTool {
    fn name(&self) -> &str {
        "task_update"
    }
    fn description(&self) -> &str {
        "Update a task's status (pending/in_progress/completed/blocked) \
         and/or reassign it."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "status": { "type": "string", "enum": ["pending", "in_progress", "completed", "blocked"] },
                "assigned_to": { "type": "string" },
            },
            "required": ["task_id"]
        })
    }
    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let task_id = required_str(&input, "task_id")?;
        let mut changes = Vec::new();
        if let Some(s) = input["status"].as_str() {
            let status = TaskStatus::parse(s)
                .ok_or_else(|| ToolError::InvalidInput(format!("bad status: {s}")))?;
            self.db
                .update_task_status(task_id, status)
                .map_err(|e| ToolError::InvalidInput(e.to_string()))?;
            changes.push(format!("status={s}"));
        }
        if let Some(a) = input["assigned_to"].as_str() {
            self.db.assign_task(task_id, a).map_err(store_err)?;
            changes.push(format!("assigned_to={a}"));
        }
        if changes.is_empty() {
            return Err(ToolError::InvalidInput(
                "nothing to update: pass status and/or assigned_to".into(),
            ));
        }
        Ok(format!("updated {task_id}: {}", changes.join(", ")))
    }
}

pub struct TaskNoteTool {
    db: Arc<Database>,
}

#[async_trait]
impl Tool for TaskNoteTool {
    fn name(&self) -> &str {
        "task_note"
    }
    fn description(&self) -> &str {
        "Append a note to a task's discussion thread. Notes are the \
         cross-agent coordination channel; they are ordered per task."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "content": { "type": "string" },
            },
            "required": ["task_id", "content"]
        })
    }
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let note = self
            .db
            .add_task_note(
                required_str(&input, "task_id")?,
                &ctx.agent_name,
                required_str(&input, "content")?,
            )
            .map_err(|e| ToolError::InvalidInput(e.to_string()))?;
        Ok(format!("noted {} on {}", note.id, note.task_id))
    }
}

// ─── Delegate tool ────────────────────────────────────────────────────────────

/// Spawns an ephemeral agent for one focused prompt and returns its final
/// text.  The sub-agent gets the coordination toolset but never this tool,
/// so delegation cannot recurse.
pub struct DelegateTool {
    pub session_id: String,
    pub manager: Arc<SessionManager>,
    pub provider: Arc<dyn ModelProvider>,
    pub config: Arc<Config>,
    pub approval: Option<Arc<dyn ApprovalGate>>,
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }
    fn description(&self) -> &str {
        "Spawn an ephemeral agent to complete a focused task and return its \
         final text output. Useful for isolated sub-tasks."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "The task for the sub-agent" },
                "name": { "type": "string", "description": "Agent name (generated when omitted)" },
            },
            "required": ["prompt"]
        })
    }
    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let prompt = required_str(&input, "prompt")?.to_string();
        let name = input["name"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("delegate-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
            });

        let meta = self
            .manager
            .add_agent(
                &self.session_id,
                &name,
                lace_store::AgentKind::Ephemeral,
                self.provider.name(),
                self.provider.model_name(),
            )
            .map_err(store_err)?;
        debug!(agent = %meta.name, thread = %meta.id, "delegating");

        // Restricted toolset: coordination tools only, no delegate.
        let registry = coordination_registry(Arc::clone(self.manager.store().db()));
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let mut executor =
            ToolExecutor::new(Arc::new(registry), &self.config.executor).with_events(exec_tx);
        if let Some(gate) = &self.approval {
            executor = executor.with_approval(Arc::clone(gate));
        }

        let activity = self.manager.activity().clone();
        let queue = Arc::new(MessageQueue::new(
            self.config.queue.capacity,
            &meta.id,
            activity.clone(),
        ));
        let mut agent = Agent::new(
            &meta.name,
            &self.session_id,
            &meta.id,
            Arc::clone(self.manager.store()),
            Arc::clone(&self.provider),
            Arc::new(executor),
            exec_rx,
            TokenBudget::new(self.config.model.context_window, &self.config.budget),
            strategy_from_config(&self.config.compaction),
            queue,
            activity,
            Arc::new(self.config.agent.clone()),
            self.config.compaction.keep_shadows,
        )
        .map_err(store_err)?;

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let collector = tokio::spawn(async move {
            let mut output = String::new();
            while let Some(event) = rx.recv().await {
                if let AgentEvent::MessageComplete(text) = event {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&text);
                }
            }
            output
        });

        let submit_result = agent.submit(&prompt, tx).await;
        let output = collector.await.unwrap_or_default();

        let _ = self.manager.complete_agent(&meta.id);

        match submit_result {
            Ok(()) if output.is_empty() => Ok("(sub-agent produced no text output)".into()),
            Ok(()) => Ok(output),
            Err(e) => Err(ToolError::Other(format!("sub-agent failed: {e}"))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
