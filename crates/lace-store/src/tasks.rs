// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{parse_ts, Database};
use crate::error::{Result, StoreError};

/// Task status with a constrained transition closure:
/// pending ↔ blocked, pending → in_progress → completed, in_progress ↔ blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Whether `self → to` is a legal transition.  Same-state updates are
    /// accepted as no-ops.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (Pending, Blocked)
                | (Blocked, Pending)
                | (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Blocked)
                | (Blocked, InProgress)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// A unit of work shared between the agents of one session.
///
/// `assigned_to` is an agent name, or `new:<provider>/<model>` to ask the
/// session manager to spawn an ephemeral agent for it.  Notes are
/// append-only and lazy-loaded (list queries do not include them).
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Detailed instructions handed to the executing agent.
    pub prompt: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskNote {
    pub id: String,
    pub task_id: String,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub prompt: String,
    pub priority: Option<TaskPriority>,
    pub assigned_to: Option<String>,
}

impl Database {
    pub fn create_task(
        &self,
        session_id: &str,
        created_by: &str,
        new: NewTask,
    ) -> Result<Task> {
        let task = Task {
            id: format!("task_{}", uuid::Uuid::new_v4().simple()),
            title: new.title,
            description: new.description,
            prompt: new.prompt,
            status: TaskStatus::Pending,
            priority: new.priority.unwrap_or(TaskPriority::Medium),
            assigned_to: new.assigned_to,
            created_by: created_by.to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.lock().execute(
            "INSERT INTO tasks
               (id, title, description, prompt, status, priority, assigned_to,
                created_by, session_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.id,
                task.title,
                task.description,
                task.prompt,
                task.status.as_str(),
                task.priority.as_str(),
                task.assigned_to,
                task.created_by,
                task.session_id,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, description, prompt, status, priority, assigned_to,
                    created_by, session_id, created_at, updated_at
             FROM tasks WHERE id = ?1",
        )?;
        let task = stmt.query_row([task_id], row_to_task).optional()?;
        Ok(task)
    }

    /// Tasks assigned to one agent, most urgent first.
    pub fn list_tasks_for_assignee(&self, assignee: &str) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, description, prompt, status, priority, assigned_to,
                    created_by, session_id, created_at, updated_at
             FROM tasks WHERE assigned_to = ?1
             ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END, id",
        )?;
        let tasks = stmt
            .query_map([assignee], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn list_session_tasks(&self, session_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, description, prompt, status, priority, assigned_to,
                    created_by, session_id, created_at, updated_at
             FROM tasks WHERE session_id = ?1 ORDER BY id",
        )?;
        let tasks = stmt
            .query_map([session_id], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Update a task's status, enforcing the transition closure.
    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<Task> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        if !task.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: task.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        self.lock().execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(Task {
            status,
            updated_at: Utc::now(),
            ..task
        })
    }

    pub fn assign_task(&self, task_id: &str, assignee: &str) -> Result<Task> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        self.lock().execute(
            "UPDATE tasks SET assigned_to = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, assignee, Utc::now().to_rfc3339()],
        )?;
        Ok(Task {
            assigned_to: Some(assignee.to_string()),
            updated_at: Utc::now(),
            ..task
        })
    }

    /// Append a note to a task's thread of notes (FIFO per task).
    pub fn add_task_note(
        &self,
        task_id: &str,
        author: &str,
        content: &str,
    ) -> Result<TaskNote> {
        if self.get_task(task_id)?.is_none() {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        let note = TaskNote {
            id: format!("note_{}", uuid::Uuid::new_v4().simple()),
            task_id: task_id.to_string(),
            author: author.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        self.lock().execute(
            "INSERT INTO task_notes (id, task_id, author, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                note.id,
                note.task_id,
                note.author,
                note.content,
                note.timestamp.to_rfc3339()
            ],
        )?;
        Ok(note)
    }

    /// Notes of one task in append order.  Loaded on demand only.
    pub fn list_task_notes(&self, task_id: &str) -> Result<Vec<TaskNote>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, author, content, timestamp
             FROM task_notes WHERE task_id = ?1 ORDER BY rowid",
        )?;
        let notes = stmt
            .query_map([task_id], |row| {
                let ts: String = row.get(4)?;
                Ok(TaskNote {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    author: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: parse_ts(&ts),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(notes)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        prompt: row.get(3)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        priority: TaskPriority::parse(&priority).unwrap_or(TaskPriority::Medium),
        assigned_to: row.get(6)?,
        created_by: row.get(7)?,
        session_id: row.get(8)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
