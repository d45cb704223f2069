// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use chrono::Utc;
use tracing::{debug, info};

use lace_store::{AgentKind, AgentMeta, AgentState, EventPayload, Task, ThreadStore};

use crate::activity::ActivityLog;

/// Marker written as the first event of every session thread.
const SESSION_MARKER: &str = "session: ";

/// A session: a top-level thread owning a set of cooperating agents whose
/// threads are its children (`sessionId.N`).
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub agents: Vec<AgentMeta>,
    pub active_agent_id: Option<String>,
}

/// Lifecycle manager for sessions and the agents within them.
///
/// Owns no agent runtimes — only identifiers and persisted metadata; the
/// host wires runtimes from the metadata (breaking the Agent ↔ Session
/// reference cycle by construction).
pub struct SessionManager {
    store: Arc<ThreadStore>,
    activity: ActivityLog,
    active: Mutex<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new(store: Arc<ThreadStore>, activity: ActivityLog) -> Self {
        Self {
            store,
            activity,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ThreadStore> {
        &self.store
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn create_session(&self, name: &str) -> anyhow::Result<Session> {
        let id = self.store.generate_thread_id();
        self.store.create_thread(&id)?;
        self.store
            .append(&id, EventPayload::local_system(format!("{SESSION_MARKER}{name}")))?;
        info!(session_id = %id, name, "session created");
        Ok(Session {
            id,
            name: name.to_string(),
            agents: Vec::new(),
            active_agent_id: None,
        })
    }

    pub fn load_session(&self, id: &str) -> anyhow::Result<Session> {
        let thread = self.store.get_or_load(id)?;
        let name = thread
            .events
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::LocalSystemMessage { message } => {
                    message.strip_prefix(SESSION_MARKER).map(str::to_string)
                }
                _ => None,
            })
            .with_context(|| format!("thread {id} is not a session"))?;
        let agents = self.store.db().list_agents(id)?;
        let active_agent_id = self.active.lock().expect("active lock").get(id).cloned();
        Ok(Session {
            id: id.to_string(),
            name,
            agents,
            active_agent_id,
        })
    }

    /// Find a session thread by its user-visible name.
    pub fn find_session_by_name(&self, name: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id))
    }

    /// All known sessions as `(thread_id, name)` pairs.
    pub fn list_sessions(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut sessions = Vec::new();
        for id in self.store.db().list_threads()? {
            if id.contains('.') || id.contains("_v") {
                continue;
            }
            let events = self.store.db().load_events(&id)?;
            if let Some(name) = events.first().and_then(|e| match &e.payload {
                EventPayload::LocalSystemMessage { message } => {
                    message.strip_prefix(SESSION_MARKER).map(str::to_string)
                }
                _ => None,
            }) {
                sessions.push((id, name));
            }
        }
        Ok(sessions)
    }

    /// Load the session named `name`, creating it first if it does not
    /// exist.  This is the whole contract the CLI needs.
    pub fn open(&self, name: &str) -> anyhow::Result<Session> {
        match self.find_session_by_name(name)? {
            Some(id) => self.load_session(&id),
            None => self.create_session(name),
        }
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    /// Register a new agent in the session: allocates the next child thread
    /// id, creates its thread, and persists the metadata.  Names must be
    /// unique within the session.
    pub fn add_agent(
        &self,
        session_id: &str,
        name: &str,
        kind: AgentKind,
        provider: &str,
        model: &str,
    ) -> anyhow::Result<AgentMeta> {
        let existing = self.store.db().list_agents(session_id)?;
        if existing.iter().any(|a| a.name == name) {
            bail!("agent name '{name}' already exists in session {session_id}");
        }

        let thread_id = self.next_child_id(session_id)?;
        self.store.create_thread(&thread_id)?;
        let now = Utc::now();
        let meta = AgentMeta {
            id: thread_id,
            session_id: session_id.to_string(),
            name: name.to_string(),
            kind,
            provider: provider.to_string(),
            model: model.to_string(),
            state: AgentState::Active,
            current_task_id: None,
            created_at: now,
            last_active_at: now,
        };
        self.store.db().upsert_agent(&meta)?;
        debug!(agent_id = %meta.id, name, kind = kind.as_str(), "agent added");
        Ok(meta)
    }

    /// Next free `sessionId.N`.  Gaps from archived agents are not reused;
    /// the counter continues past the highest child ever created (threads
    /// outlive their agent rows).
    fn next_child_id(&self, session_id: &str) -> anyhow::Result<String> {
        let prefix = format!("{session_id}.");
        let mut max_n = 0usize;
        for id in self.store.db().list_threads_with_prefix(&prefix)? {
            let suffix = &id[prefix.len()..];
            if suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = suffix.parse::<usize>() {
                    max_n = max_n.max(n);
                }
            }
        }
        Ok(ThreadStore::child_thread_id(session_id, max_n + 1))
    }

    pub fn get_agent(&self, agent_id: &str) -> anyhow::Result<AgentMeta> {
        self.store
            .db()
            .get_agent(agent_id)?
            .with_context(|| format!("unknown agent {agent_id}"))
    }

    /// Agents of a session.  Completed agents are hidden unless asked for.
    pub fn list_agents(
        &self,
        session_id: &str,
        include_completed: bool,
    ) -> anyhow::Result<Vec<AgentMeta>> {
        let agents = self.store.db().list_agents(session_id)?;
        Ok(agents
            .into_iter()
            .filter(|a| include_completed || a.state != AgentState::Completed)
            .collect())
    }

    pub fn set_active_agent(&self, session_id: &str, agent_id: &str) -> anyhow::Result<()> {
        let meta = self.get_agent(agent_id)?;
        if meta.session_id != session_id {
            bail!("agent {agent_id} does not belong to session {session_id}");
        }
        self.active
            .lock()
            .expect("active lock")
            .insert(session_id.to_string(), agent_id.to_string());
        Ok(())
    }

    pub fn get_active_agent(&self, session_id: &str) -> Option<String> {
        self.active
            .lock()
            .expect("active lock")
            .get(session_id)
            .cloned()
    }

    /// Suspend a persistent agent.  Ephemeral agents cannot suspend: their
    /// lifecycle only moves forward.
    pub fn suspend_agent(&self, agent_id: &str) -> anyhow::Result<AgentMeta> {
        self.transition_agent(agent_id, AgentState::Suspended)
    }

    pub fn resume_agent(&self, agent_id: &str) -> anyhow::Result<AgentMeta> {
        self.transition_agent(agent_id, AgentState::Active)
    }

    pub fn complete_agent(&self, agent_id: &str) -> anyhow::Result<AgentMeta> {
        self.transition_agent(agent_id, AgentState::Completed)
    }

    fn transition_agent(&self, agent_id: &str, to: AgentState) -> anyhow::Result<AgentMeta> {
        let mut meta = self.get_agent(agent_id)?;
        let allowed = match (meta.kind, meta.state, to) {
            // Persistent agents toggle freely and may finish from either state.
            (AgentKind::Persistent, AgentState::Active, AgentState::Suspended) => true,
            (AgentKind::Persistent, AgentState::Suspended, AgentState::Active) => true,
            (AgentKind::Persistent, AgentState::Active, AgentState::Completed) => true,
            (AgentKind::Persistent, AgentState::Suspended, AgentState::Completed) => true,
            // Ephemeral agents only move forward.
            (AgentKind::Ephemeral, AgentState::Active, AgentState::Completed) => true,
            _ => meta.state == to,
        };
        if !allowed {
            bail!(
                "invalid {} agent transition: {} -> {}",
                meta.kind.as_str(),
                meta.state.as_str(),
                to.as_str()
            );
        }
        meta.state = to;
        meta.last_active_at = Utc::now();
        self.store.db().upsert_agent(&meta)?;
        debug!(agent_id, state = to.as_str(), "agent state changed");
        Ok(meta)
    }

    /// Remove the metadata rows of completed agents (their threads remain).
    /// With `older_than`, only agents idle at least that long are removed.
    pub fn archive_completed_agents(
        &self,
        session_id: &str,
        older_than: Option<chrono::Duration>,
    ) -> anyhow::Result<usize> {
        let cutoff = older_than.map(|d| Utc::now() - d);
        let mut archived = 0usize;
        for agent in self.store.db().list_agents(session_id)? {
            if agent.state != AgentState::Completed {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if agent.last_active_at > cutoff {
                    continue;
                }
            }
            self.store.db().delete_agent(&agent.id)?;
            archived += 1;
        }
        Ok(archived)
    }

    // ── Task-driven spawning ──────────────────────────────────────────────────

    /// Resolve `new:<provider>/<model>` task assignees by spawning an
    /// ephemeral agent per task and reassigning the task to it.
    pub fn resolve_new_assignees(&self, session_id: &str) -> anyhow::Result<Vec<AgentMeta>> {
        let mut spawned = Vec::new();
        for task in self.store.db().list_session_tasks(session_id)? {
            let Some(spec) = task
                .assigned_to
                .as_deref()
                .and_then(|a| a.strip_prefix("new:"))
            else {
                continue;
            };
            let (provider, model) = spec
                .split_once('/')
                .with_context(|| format!("bad spawn assignee on task {}: {spec:?}", task.id))?;
            let meta = self.spawn_for_task(session_id, &task, provider, model)?;
            self.store.db().assign_task(&task.id, &meta.name)?;
            spawned.push(meta);
        }
        Ok(spawned)
    }

    fn spawn_for_task(
        &self,
        session_id: &str,
        task: &Task,
        provider: &str,
        model: &str,
    ) -> anyhow::Result<AgentMeta> {
        let short = task.id.trim_start_matches("task_");
        let name = format!("task-{}", &short[..8.min(short.len())]);
        let mut meta = self.add_agent(session_id, &name, AgentKind::Ephemeral, provider, model)?;
        meta.current_task_id = Some(task.id.clone());
        self.store.db().upsert_agent(&meta)?;
        info!(agent = %meta.name, task_id = %task.id, "spawned ephemeral agent for task");
        Ok(meta)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
