// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::activity::ActivityLog;
use crate::events::ActivityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    User,
    System,
    TaskNotification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessagePriority {
    Normal,
    High,
}

/// A message waiting for its agent to become idle.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub from_agent: Option<String>,
    pub priority: MessagePriority,
    pub source: Option<String>,
}

impl QueuedMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            kind: MessageKind::User,
            content: content.into(),
            timestamp: Utc::now(),
            task_id: None,
            from_agent: None,
            priority: MessagePriority::Normal,
            source: None,
        }
    }

    pub fn task_notification(
        content: impl Into<String>,
        task_id: impl Into<String>,
        from_agent: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::TaskNotification,
            task_id: Some(task_id.into()),
            from_agent: Some(from_agent.into()),
            ..Self::user(content)
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub length: usize,
    pub oldest_age_ms: u64,
    pub high_priority_count: usize,
}

/// Per-agent message buffer: enqueue is always permitted, consumption only
/// happens when the agent is idle.  High-priority messages drain before
/// normal ones but never preempt a running turn.
///
/// A configured cap bounds the queue; on overflow the oldest normal-priority
/// message is dropped and one `queue_overflow` signal is emitted.  A
/// normal-priority arrival that finds the queue full of high-priority
/// messages is itself the dropped one.
pub struct MessageQueue {
    inner: Mutex<VecDeque<QueuedMessage>>,
    capacity: usize,
    thread_id: String,
    activity: ActivityLog,
}

impl MessageQueue {
    pub fn new(capacity: usize, thread_id: impl Into<String>, activity: ActivityLog) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            thread_id: thread_id.into(),
            activity,
        }
    }

    pub fn enqueue(&self, msg: QueuedMessage) {
        let mut q = self.inner.lock().expect("queue lock");
        if q.len() >= self.capacity {
            // Drop the oldest normal-priority message to make room.
            if let Some(pos) = q
                .iter()
                .position(|m| m.priority == MessagePriority::Normal)
            {
                let dropped = q.remove(pos).expect("position just found");
                self.activity.emit_kind(
                    ActivityKind::QueueOverflow,
                    &self.thread_id,
                    json!({ "dropped_id": dropped.id, "capacity": self.capacity }),
                );
            } else if msg.priority == MessagePriority::Normal {
                // Queue is all high-priority; the incoming normal message
                // is the one that gives way.
                self.activity.emit_kind(
                    ActivityKind::QueueOverflow,
                    &self.thread_id,
                    json!({ "dropped_id": msg.id, "capacity": self.capacity }),
                );
                return;
            }
            // An incoming high-priority message into an all-high queue
            // falls through: the capacity check above freed no slot, but
            // high-priority arrivals are never silently discarded.
        }
        self.activity.emit_kind(
            ActivityKind::MessageQueued,
            &self.thread_id,
            json!({ "id": msg.id, "priority": format!("{:?}", msg.priority) }),
        );
        q.push_back(msg);
    }

    /// Take the next message: the oldest high-priority one, else the oldest.
    pub fn pop(&self) -> Option<QueuedMessage> {
        let mut q = self.inner.lock().expect("queue lock");
        let idx = q
            .iter()
            .position(|m| m.priority == MessagePriority::High)
            .unwrap_or(0);
        q.remove(idx)
    }

    /// Drain everything in consumption order.
    pub fn drain(&self) -> Vec<QueuedMessage> {
        let mut out = Vec::new();
        while let Some(m) = self.pop() {
            out.push(m);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let q = self.inner.lock().expect("queue lock");
        let now = Utc::now();
        let oldest_age_ms = q
            .iter()
            .map(|m| (now - m.timestamp).num_milliseconds().max(0) as u64)
            .max()
            .unwrap_or(0);
        QueueStats {
            length: q.len(),
            oldest_age_ms,
            high_priority_count: q
                .iter()
                .filter(|m| m.priority == MessagePriority::High)
                .count(),
        }
    }

    /// Remove messages matching `filter` (all messages when `None`).
    /// Returns how many were removed.
    pub fn clear(&self, filter: Option<&dyn Fn(&QueuedMessage) -> bool>) -> usize {
        let mut q = self.inner.lock().expect("queue lock");
        let before = q.len();
        match filter {
            None => q.clear(),
            Some(f) => q.retain(|m| !f(m)),
        }
        let removed = before - q.len();
        if removed > 0 {
            self.activity.emit_kind(
                ActivityKind::QueueCleared,
                &self.thread_id,
                json!({ "removed": removed }),
            );
        }
        removed
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActivityKind;

    fn queue(capacity: usize) -> (MessageQueue, tokio::sync::broadcast::Receiver<crate::events::ActivityEvent>) {
        let log = ActivityLog::new();
        let rx = log.subscribe();
        (MessageQueue::new(capacity, "t1", log), rx)
    }

    fn high(content: &str) -> QueuedMessage {
        QueuedMessage::user(content).with_priority(MessagePriority::High)
    }

    #[test]
    fn fifo_within_priority() {
        let (q, _rx) = queue(10);
        q.enqueue(QueuedMessage::user("a"));
        q.enqueue(QueuedMessage::user("b"));
        assert_eq!(q.pop().unwrap().content, "a");
        assert_eq!(q.pop().unwrap().content, "b");
        assert!(q.pop().is_none());
    }

    #[test]
    fn high_priority_jumps_ahead() {
        let (q, _rx) = queue(10);
        q.enqueue(QueuedMessage::user("m1"));
        q.enqueue(high("m2"));
        q.enqueue(QueuedMessage::user("m3"));
        let order: Vec<String> = q.drain().into_iter().map(|m| m.content).collect();
        assert_eq!(order, vec!["m2", "m1", "m3"]);
    }

    #[test]
    fn multiple_high_priority_stay_fifo_among_themselves() {
        let (q, _rx) = queue(10);
        q.enqueue(high("h1"));
        q.enqueue(QueuedMessage::user("n1"));
        q.enqueue(high("h2"));
        let order: Vec<String> = q.drain().into_iter().map(|m| m.content).collect();
        assert_eq!(order, vec!["h1", "h2", "n1"]);
    }

    #[test]
    fn overflow_drops_oldest_normal_and_signals_once() {
        let (q, mut rx) = queue(2);
        q.enqueue(QueuedMessage::user("old"));
        q.enqueue(high("keep"));
        q.enqueue(QueuedMessage::user("new"));
        let contents: Vec<String> = q.drain().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["keep", "new"], "oldest normal was dropped");

        let mut overflow_count = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == ActivityKind::QueueOverflow {
                overflow_count += 1;
            }
        }
        assert_eq!(overflow_count, 1, "exactly one overflow signal");
    }

    #[test]
    fn overflow_with_all_high_rejects_incoming_normal() {
        let (q, _rx) = queue(2);
        q.enqueue(high("h1"));
        q.enqueue(high("h2"));
        q.enqueue(QueuedMessage::user("n"));
        let contents: Vec<String> = q.drain().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["h1", "h2"]);
    }

    #[test]
    fn overflow_never_drops_high_priority() {
        let (q, _rx) = queue(2);
        q.enqueue(high("h1"));
        q.enqueue(high("h2"));
        q.enqueue(high("h3"));
        assert_eq!(q.len(), 3, "high-priority arrivals are not discarded");
    }

    #[test]
    fn stats_reflect_contents() {
        let (q, _rx) = queue(10);
        assert_eq!(q.stats().length, 0);
        q.enqueue(QueuedMessage::user("a"));
        q.enqueue(high("b"));
        let stats = q.stats();
        assert_eq!(stats.length, 2);
        assert_eq!(stats.high_priority_count, 1);
    }

    #[test]
    fn clear_with_filter_removes_matching_only() {
        let (q, _rx) = queue(10);
        q.enqueue(QueuedMessage::task_notification("done", "task_1", "worker"));
        q.enqueue(QueuedMessage::user("keep me"));
        let removed = q.clear(Some(&|m: &QueuedMessage| {
            m.kind == MessageKind::TaskNotification
        }));
        assert_eq!(removed, 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().content, "keep me");
    }

    #[test]
    fn clear_without_filter_removes_everything() {
        let (q, _rx) = queue(10);
        q.enqueue(QueuedMessage::user("a"));
        q.enqueue(QueuedMessage::user("b"));
        assert_eq!(q.clear(None), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn enqueue_emits_message_queued() {
        let (q, mut rx) = queue(10);
        q.enqueue(QueuedMessage::user("a"));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, ActivityKind::MessageQueued);
    }
}
