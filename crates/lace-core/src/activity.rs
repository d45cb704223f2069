// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::broadcast;
use tracing::trace;

use crate::events::{ActivityEvent, ActivityKind};

const CHANNEL_CAPACITY: usize = 1024;

/// Non-blocking fan-out of runtime activity to in-process subscribers.
///
/// Built on a broadcast channel: `emit` never waits, and a subscriber that
/// falls behind loses the oldest entries rather than stalling the runtime.
/// The loss surfaces on the subscriber side as a `Lagged` recv error.
#[derive(Clone)]
pub struct ActivityLog {
    tx: broadcast::Sender<ActivityEvent>,
}

impl ActivityLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish one event.  A send with no live subscribers is a no-op.
    pub fn emit(&self, event: ActivityEvent) {
        trace!(
            kind = event.kind.as_str(),
            thread_id = %event.thread_id,
            "activity"
        );
        let _ = self.tx.send(event);
    }

    pub fn emit_kind(
        &self,
        kind: ActivityKind,
        thread_id: impl Into<String>,
        payload: serde_json::Value,
    ) {
        self.emit(ActivityEvent::new(kind, thread_id, payload));
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
