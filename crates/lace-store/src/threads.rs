// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::event::{EventPayload, Thread, ThreadEvent};

/// In-memory cache over [`Database`] with canonical-id resolution.
///
/// Reads resolve a canonical id to its current physical version through the
/// version mapping; writes always target the physical id they are given.
/// The mapping is a read-time indirection only, which is what makes
/// compaction a pure create-then-swap: the old physical thread is never
/// rewritten and external references to the canonical id stay valid.
pub struct ThreadStore {
    db: Arc<Database>,
    /// Cache keyed by *physical* thread id.
    cache: Mutex<HashMap<String, Vec<ThreadEvent>>>,
}

impl ThreadStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Generate a fresh top-level thread id: a date-prefixed random token.
    pub fn generate_thread_id(&self) -> String {
        let date = Utc::now().format("%Y%m%d");
        let token = uuid::Uuid::new_v4().simple().to_string();
        format!("{date}-{}", &token[..12])
    }

    /// Child thread id `parent.N`.
    pub fn child_thread_id(parent: &str, n: usize) -> String {
        format!("{parent}.{n}")
    }

    /// Create a new empty thread row.
    pub fn create_thread(&self, id: &str) -> Result<()> {
        self.db.save_thread(id)
    }

    /// Resolve any id (canonical, current version, or old shadow) to the
    /// canonical id external callers should hold.
    pub fn get_canonical_id(&self, any_id: &str) -> Result<String> {
        Ok(self
            .db
            .find_canonical_id_for_version(any_id)?
            .unwrap_or_else(|| any_id.to_string()))
    }

    /// Resolve a canonical id to the physical thread currently backing it.
    /// Ids without a version mapping back themselves.
    pub fn resolve_physical(&self, id: &str) -> Result<String> {
        Ok(self
            .db
            .get_current_version(id)?
            .unwrap_or_else(|| id.to_string()))
    }

    /// Load a thread through the canonical indirection, caching the event
    /// list by physical id.
    pub fn get_or_load(&self, id: &str) -> Result<Thread> {
        let physical = self.resolve_physical(id)?;

        if let Some(events) = self.cache.lock().expect("cache lock").get(&physical) {
            return Ok(Thread {
                canonical_id: id.to_string(),
                id: physical.clone(),
                created_at: events
                    .first()
                    .map(|e| e.timestamp)
                    .unwrap_or_else(Utc::now),
                events: events.clone(),
            });
        }

        let thread = self
            .db
            .load_thread(&physical)?
            .ok_or_else(|| StoreError::ThreadNotFound(id.to_string()))?;
        self.cache
            .lock()
            .expect("cache lock")
            .insert(physical.clone(), thread.events.clone());
        Ok(Thread {
            canonical_id: id.to_string(),
            id: physical,
            created_at: thread.created_at,
            events: thread.events,
        })
    }

    /// Ordered events of a thread, resolving the canonical indirection.
    pub fn events(&self, id: &str) -> Result<Vec<ThreadEvent>> {
        Ok(self.get_or_load(id)?.events)
    }

    /// Append one event to a *physical* thread.  No canonical resolution —
    /// writers hold the physical id of the version they are extending.
    pub fn append(&self, thread_id: &str, payload: EventPayload) -> Result<ThreadEvent> {
        let event = self.db.append_event(thread_id, &payload)?;
        let mut cache = self.cache.lock().expect("cache lock");
        if let Some(events) = cache.get_mut(thread_id) {
            events.push(event.clone());
        }
        Ok(event)
    }

    /// Compaction primitive: write `events` into a brand-new physical thread
    /// and swap the canonical mapping to it.  Returns the new physical id.
    ///
    /// The payloads are re-appended so the new thread gets its own dense seq
    /// numbering starting at 1.
    pub fn create_version_thread(
        &self,
        canonical_id: &str,
        events: Vec<EventPayload>,
        reason: &str,
    ) -> Result<String> {
        let new_id = format!("{}_v{}", canonical_id, Utc::now().timestamp_millis());
        self.db.save_thread(&new_id)?;
        for payload in &events {
            self.db.append_event(&new_id, payload)?;
        }
        self.db.create_version(canonical_id, &new_id, reason)?;
        // Prime the cache for the new version.
        let loaded = self.db.load_events(&new_id)?;
        self.cache
            .lock()
            .expect("cache lock")
            .insert(new_id.clone(), loaded);
        debug!(canonical_id, new_id, reason, "thread version swapped");
        Ok(new_id)
    }

    /// Drop superseded shadow threads, keeping the most recent `keep_last`.
    pub fn cleanup_old_shadows(&self, canonical_id: &str, keep_last: usize) -> Result<usize> {
        let deleted = self.db.cleanup_old_shadows(canonical_id, keep_last)?;
        // Evict anything the delete may have touched.
        if deleted > 0 {
            let live: std::collections::HashSet<String> =
                self.db.list_threads()?.into_iter().collect();
            self.cache
                .lock()
                .expect("cache lock")
                .retain(|id, _| live.contains(id));
        }
        Ok(deleted)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ThreadStore {
        ThreadStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn generated_ids_are_date_prefixed_and_unique() {
        let s = store();
        let a = s.generate_thread_id();
        let b = s.generate_thread_id();
        assert_ne!(a, b);
        let date = Utc::now().format("%Y%m%d").to_string();
        assert!(a.starts_with(&date));
        assert!(a.contains('-'));
    }

    #[test]
    fn child_ids_are_dot_separated() {
        assert_eq!(ThreadStore::child_thread_id("sess", 3), "sess.3");
    }

    #[test]
    fn get_or_load_unknown_thread_errors() {
        let s = store();
        assert!(matches!(
            s.get_or_load("missing"),
            Err(StoreError::ThreadNotFound(_))
        ));
    }

    #[test]
    fn append_then_load_round_trip() {
        let s = store();
        s.create_thread("t").unwrap();
        s.append("t", EventPayload::user("one")).unwrap();
        s.append("t", EventPayload::agent("two")).unwrap();
        let thread = s.get_or_load("t").unwrap();
        assert_eq!(thread.events.len(), 2);
        assert_eq!(thread.canonical_id, "t");
        assert_eq!(thread.id, "t");
    }

    #[test]
    fn cache_stays_coherent_across_appends() {
        let s = store();
        s.create_thread("t").unwrap();
        s.append("t", EventPayload::user("a")).unwrap();
        let _ = s.get_or_load("t").unwrap(); // populate cache
        s.append("t", EventPayload::agent("b")).unwrap();
        let thread = s.get_or_load("t").unwrap();
        assert_eq!(thread.events.len(), 2, "cached entry must see new appends");
    }

    #[test]
    fn version_swap_redirects_reads_but_not_writes() {
        let s = store();
        s.create_thread("canon").unwrap();
        s.append("canon", EventPayload::user("old-1")).unwrap();
        s.append("canon", EventPayload::user("old-2")).unwrap();

        let new_id = s
            .create_version_thread(
                "canon",
                vec![EventPayload::agent("summary"), EventPayload::user("old-2")],
                "compaction",
            )
            .unwrap();

        // Reads through the canonical id see the new version.
        let thread = s.get_or_load("canon").unwrap();
        assert_eq!(thread.id, new_id);
        assert_eq!(thread.canonical_id, "canon");
        assert_eq!(thread.events.len(), 2);

        // Writes to the old physical id still land on the old thread.
        s.append("canon", EventPayload::user("late")).unwrap();
        assert_eq!(s.db().load_events("canon").unwrap().len(), 3);
        assert_eq!(s.get_or_load("canon").unwrap().events.len(), 2);
    }

    #[test]
    fn canonical_id_reverse_lookup_covers_versions() {
        let s = store();
        s.create_thread("canon").unwrap();
        let v = s
            .create_version_thread("canon", vec![EventPayload::user("x")], "compaction")
            .unwrap();
        assert_eq!(s.get_canonical_id(&v).unwrap(), "canon");
        assert_eq!(s.get_canonical_id("canon").unwrap(), "canon");
        assert_eq!(s.get_canonical_id("unrelated").unwrap(), "unrelated");
    }

    #[test]
    fn new_version_reassigns_dense_seq() {
        let s = store();
        s.create_thread("canon").unwrap();
        for i in 0..5 {
            s.append("canon", EventPayload::user(format!("m{i}"))).unwrap();
        }
        let v = s
            .create_version_thread(
                "canon",
                vec![EventPayload::agent("sum"), EventPayload::user("m4")],
                "compaction",
            )
            .unwrap();
        let seqs: Vec<i64> = s.db().load_events(&v).unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn canonical_and_current_version_load_identically() {
        let s = store();
        s.create_thread("canon").unwrap();
        let v = s
            .create_version_thread("canon", vec![EventPayload::user("kept")], "compaction")
            .unwrap();
        let via_canonical = s.get_or_load("canon").unwrap().events;
        let via_version = s.get_or_load(&v).unwrap().events;
        assert_eq!(via_canonical, via_version);
    }

    #[test]
    fn shadow_cleanup_evicts_cache() {
        let s = store();
        s.create_thread("canon").unwrap();
        let mut versions = Vec::new();
        for i in 0..4 {
            let v = s
                .create_version_thread("canon", vec![EventPayload::user(format!("v{i}"))], "c")
                .unwrap();
            versions.push(v);
            // Timestamp-based version ids need distinct millis.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let deleted = s.cleanup_old_shadows("canon", 1).unwrap();
        assert_eq!(deleted, 2, "4 versions − 1 current − 1 kept shadow");
        // Deleted shadows are no longer loadable.
        assert!(s.get_or_load(&versions[0]).is_err());
        assert!(s.get_or_load(&versions[3]).is_ok());
    }
}
