// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::event::{EventPayload, Thread, ThreadEvent};

// NOTE: Storage design
//
// Why a version mapping instead of rewriting threads?
// - Compaction creates a NEW physical thread and swaps
//   thread_versions.current_version_id; the old history is never mutated.
// - External references hold the canonical id, which never changes.
// - Cleanup of superseded shadows is then a plain delete, not a rewrite.
//
// Why ORDER BY the integer primary key and not created_at?
// - Timestamps have coarse resolution; two appends within the same
//   millisecond must still replay in insertion order.
//
// Why one Mutex around the connection?
// - The write path is short transactions on a local file; a single lock is
//   the documented shared-resource policy and keeps seq assignment atomic.

/// Ordered schema migrations.  Applied atomically at open; each entry runs
/// at most once, recorded in `schema_versions`.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE threads (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );

        CREATE TABLE events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id TEXT NOT NULL REFERENCES threads(id),
            seq INTEGER NOT NULL,
            type TEXT NOT NULL,
            data_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (thread_id, seq)
        );
        CREATE INDEX idx_events_thread ON events(thread_id);

        CREATE TABLE thread_versions (
            canonical_id TEXT PRIMARY KEY,
            current_version_id TEXT NOT NULL REFERENCES threads(id),
            created_at TEXT NOT NULL
        );

        CREATE TABLE version_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            canonical_id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX idx_version_history_canonical ON version_history(canonical_id);

        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            prompt TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL CHECK (status IN ('pending','in_progress','completed','blocked')),
            priority TEXT NOT NULL CHECK (priority IN ('high','medium','low')),
            assigned_to TEXT,
            created_by TEXT NOT NULL,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX idx_tasks_session ON tasks(session_id);
        CREATE INDEX idx_tasks_assignee ON tasks(assigned_to);

        CREATE TABLE task_notes (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            author TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX idx_task_notes_task ON task_notes(task_id);
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE session_agents (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('persistent','ephemeral')),
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            state TEXT NOT NULL CHECK (state IN ('active','suspended','completed')),
            current_task_id TEXT,
            created_at TEXT NOT NULL,
            last_active_at TEXT NOT NULL,
            UNIQUE (session_id, name)
        );
        CREATE INDEX idx_session_agents_session ON session_agents(session_id);
        "#,
    ),
];

/// One row of the append-only version history.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub canonical_id: String,
    pub version_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Persistent,
    Ephemeral,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Ephemeral => "ephemeral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "persistent" => Some(Self::Persistent),
            "ephemeral" => Some(Self::Ephemeral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Active,
    Suspended,
    Completed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Persisted metadata of one agent within a session.  The agent's
/// conversation lives in the thread whose id equals `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMeta {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub kind: AgentKind,
    pub provider: String,
    pub model: String,
    pub state: AgentState,
    pub current_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Apply all pending migrations inside one transaction.
    ///
    /// `schema_versions` itself is created unconditionally so that the
    /// version query works on a brand-new file.
    fn migrate(&self) -> Result<()> {
        let mut conn = self.lock();
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_versions",
            [],
            |row| row.get(0),
        )?;

        let tx = conn.transaction()?;
        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            debug!(version, "applying schema migration");
            tx.execute_batch(sql)
                .map_err(|e| StoreError::Migration {
                    version: *version,
                    message: e.to_string(),
                })?;
            tx.execute(
                "INSERT INTO schema_versions (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Threads and events ────────────────────────────────────────────────────

    /// Create a thread row if it does not already exist.
    pub fn save_thread(&self, id: &str) -> Result<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO threads (id, created_at) VALUES (?1, ?2)",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn thread_exists(&self, id: &str) -> Result<bool> {
        let n: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM threads WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Append one event, assigning the next dense sequence number.
    ///
    /// The read-increment-insert is atomic: the connection mutex serializes
    /// writers and the insert runs in a transaction.
    pub fn append_event(&self, thread_id: &str, payload: &EventPayload) -> Result<ThreadEvent> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM threads WHERE id = ?1",
            [thread_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE thread_id = ?1",
            [thread_id],
            |row| row.get(0),
        )?;
        let timestamp = Utc::now();
        let data_json =
            serde_json::to_string(payload).expect("event payloads always serialize");
        tx.execute(
            "INSERT INTO events (thread_id, seq, type, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread_id,
                seq,
                payload.type_name(),
                data_json,
                timestamp.to_rfc3339()
            ],
        )?;
        tx.commit()?;

        Ok(ThreadEvent {
            seq,
            thread_id: thread_id.to_string(),
            payload: payload.clone(),
            timestamp,
        })
    }

    /// Load a thread and its full event log, or `None` when the id is unknown.
    ///
    /// No canonical-id indirection happens here; `ThreadStore` layers that on
    /// top.  `canonical_id` is therefore set equal to `id`.
    pub fn load_thread(&self, id: &str) -> Result<Option<Thread>> {
        let created_at: Option<String> = self
            .lock()
            .query_row("SELECT created_at FROM threads WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(created_at) = created_at else {
            return Ok(None);
        };
        let events = self.load_events(id)?;
        Ok(Some(Thread {
            canonical_id: id.to_string(),
            id: id.to_string(),
            created_at: parse_ts(&created_at),
            events,
        }))
    }

    /// Load the ordered event log of one physical thread.
    pub fn load_events(&self, thread_id: &str) -> Result<Vec<ThreadEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, data_json, created_at FROM events
             WHERE thread_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([thread_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, data_json, created_at) = row?;
            let payload = serde_json::from_str(&data_json).map_err(|e| {
                StoreError::CorruptEvent {
                    thread_id: thread_id.to_string(),
                    seq,
                    source: e,
                }
            })?;
            events.push(ThreadEvent {
                seq,
                thread_id: thread_id.to_string(),
                payload,
                timestamp: parse_ts(&created_at),
            });
        }
        Ok(events)
    }

    pub fn list_threads(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM threads ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Thread ids starting with `prefix` (used to enumerate a session's
    /// child threads).
    pub fn list_threads_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id FROM threads WHERE id LIKE ?1 ORDER BY id")?;
        let pattern = format!("{prefix}%");
        let ids = stmt
            .query_map([pattern], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // ── Version mapping ───────────────────────────────────────────────────────

    /// Point `canonical_id` at a new current version and record the change in
    /// the append-only history.  The target thread must exist.
    pub fn create_version(
        &self,
        canonical_id: &str,
        version_id: &str,
        reason: &str,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO thread_versions (canonical_id, current_version_id, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(canonical_id) DO UPDATE SET current_version_id = ?2",
            params![canonical_id, version_id, now],
        )?;
        tx.execute(
            "INSERT INTO version_history (canonical_id, version_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![canonical_id, version_id, reason, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_current_version(&self, canonical_id: &str) -> Result<Option<String>> {
        let v = self
            .lock()
            .query_row(
                "SELECT current_version_id FROM thread_versions WHERE canonical_id = ?1",
                [canonical_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v)
    }

    /// Reverse lookup: which canonical id does `version_id` belong to?
    /// Covers both the current version and superseded shadows.
    pub fn find_canonical_id_for_version(&self, version_id: &str) -> Result<Option<String>> {
        let v = self
            .lock()
            .query_row(
                "SELECT canonical_id FROM version_history WHERE version_id = ?1 LIMIT 1",
                [version_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_version_history(&self, canonical_id: &str) -> Result<Vec<VersionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT canonical_id, version_id, reason, created_at
             FROM version_history WHERE canonical_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([canonical_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(canonical_id, version_id, reason, created_at)| VersionRecord {
                canonical_id,
                version_id,
                reason,
                created_at: parse_ts(&created_at),
            })
            .collect())
    }

    /// Delete superseded shadow threads, keeping the most recent `keep_last`.
    ///
    /// The current version and the original canonical thread are never
    /// deleted.  History rows are retained for audit; only the thread rows
    /// and their events go, all in one transaction.  Returns the number of
    /// shadow threads deleted.
    pub fn cleanup_old_shadows(&self, canonical_id: &str, keep_last: usize) -> Result<usize> {
        let current = self.get_current_version(canonical_id)?;
        let history = self.get_version_history(canonical_id)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        // Superseded shadows, oldest first.
        let mut shadows: Vec<String> = history
            .iter()
            .map(|r| r.version_id.clone())
            .filter(|v| v != canonical_id && Some(v.as_str()) != current.as_deref())
            .collect();
        shadows.dedup();

        let delete_count = shadows.len().saturating_sub(keep_last);
        let mut deleted = 0usize;
        for victim in shadows.into_iter().take(delete_count) {
            tx.execute("DELETE FROM events WHERE thread_id = ?1", [&victim])?;
            let n = tx.execute("DELETE FROM threads WHERE id = ?1", [&victim])?;
            deleted += n;
        }
        tx.commit()?;
        debug!(canonical_id, deleted, "shadow cleanup");
        Ok(deleted)
    }

    // ── Agent metadata ────────────────────────────────────────────────────────

    pub fn upsert_agent(&self, meta: &AgentMeta) -> Result<()> {
        self.lock().execute(
            "INSERT INTO session_agents
               (id, session_id, name, kind, provider, model, state,
                current_task_id, created_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               state = ?7,
               current_task_id = ?8,
               last_active_at = ?10",
            params![
                meta.id,
                meta.session_id,
                meta.name,
                meta.kind.as_str(),
                meta.provider,
                meta.model,
                meta.state.as_str(),
                meta.current_task_id,
                meta.created_at.to_rfc3339(),
                meta.last_active_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<AgentMeta>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, name, kind, provider, model, state,
                    current_task_id, created_at, last_active_at
             FROM session_agents WHERE id = ?1",
        )?;
        let meta = stmt.query_row([id], row_to_agent).optional()?;
        Ok(meta)
    }

    pub fn list_agents(&self, session_id: &str) -> Result<Vec<AgentMeta>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, name, kind, provider, model, state,
                    current_task_id, created_at, last_active_at
             FROM session_agents WHERE session_id = ?1 ORDER BY id",
        )?;
        let agents = stmt
            .query_map([session_id], row_to_agent)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn delete_agent(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM session_agents WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentMeta> {
    let kind: String = row.get(3)?;
    let state: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    let last_active_at: String = row.get(9)?;
    Ok(AgentMeta {
        id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        kind: AgentKind::parse(&kind).unwrap_or(AgentKind::Persistent),
        provider: row.get(4)?,
        model: row.get(5)?,
        state: AgentState::parse(&state).unwrap_or(AgentState::Active),
        current_task_id: row.get(7)?,
        created_at: parse_ts(&created_at),
        last_active_at: parse_ts(&last_active_at),
    })
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
