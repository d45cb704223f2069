// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pluggable compaction strategies.
//!
//! A strategy is a pure function `events → events`: deterministic given its
//! configuration, no clock, no I/O.  The runtime applies the result by
//! writing it into a fresh physical thread and swapping the canonical
//! version mapping; nothing here mutates storage.

use std::collections::HashMap;

use lace_store::{CompactionDigest, EventPayload, ThreadEvent};

use crate::budget::TokenBudget;

/// Build the configured strategy.
pub fn strategy_from_config(cfg: &lace_config::CompactionConfig) -> std::sync::Arc<dyn CompactionStrategy> {
    match cfg.strategy {
        lace_config::CompactionStrategyKind::Summarize => std::sync::Arc::new(SummarizeStrategy {
            preserve_recent_events: cfg.preserve_recent_events,
            preserve_user_messages: cfg.preserve_user_messages,
        }),
        lace_config::CompactionStrategyKind::Truncate => std::sync::Arc::new(TruncateStrategy {
            keep_last: cfg.preserve_recent_events,
        }),
    }
}

pub trait CompactionStrategy: Send + Sync {
    /// Whether the thread has outgrown the budget and must be compacted.
    fn should_compact(&self, events: &[ThreadEvent], budget: &TokenBudget) -> bool;

    /// Produce the compacted event list.  Returns the input unchanged when
    /// nothing is summarizable.
    fn compact(&self, events: &[ThreadEvent]) -> Vec<ThreadEvent>;
}

/// Default token-based trigger shared by the built-in strategies.
fn over_budget(events: &[ThreadEvent], budget: &TokenBudget) -> bool {
    let total: usize = events.iter().map(|e| e.payload.approx_tokens()).sum();
    budget.should_block(total)
}

/// Replaces old events with one structured digest event.
///
/// Preserved verbatim: the trailing window containing the last
/// `preserve_recent_events` message events, compaction summaries from
/// earlier rounds, and — when `preserve_user_messages` is set — every user
/// message plus the final agent message of each assistant turn.  Tool
/// call/result pairs are kept or dropped together: a pair split by the
/// window boundary is summarized entirely.
#[derive(Debug, Clone)]
pub struct SummarizeStrategy {
    pub preserve_recent_events: usize,
    pub preserve_user_messages: bool,
}

impl Default for SummarizeStrategy {
    fn default() -> Self {
        Self {
            preserve_recent_events: 10,
            preserve_user_messages: true,
        }
    }
}

impl CompactionStrategy for SummarizeStrategy {
    fn should_compact(&self, events: &[ThreadEvent], budget: &TokenBudget) -> bool {
        over_budget(events, budget)
    }

    fn compact(&self, events: &[ThreadEvent]) -> Vec<ThreadEvent> {
        if events.is_empty() {
            return Vec::new();
        }

        let mut preserved = self.preserved_mask(events);
        demote_split_tool_pairs(events, &mut preserved);

        if preserved.iter().all(|&p| p) {
            return renumber(events.to_vec());
        }

        let digest = build_digest(events, &preserved);
        let replaced_range = summarized_seq_range(events, &preserved);
        let summary_timestamp = events
            .iter()
            .zip(&preserved)
            .filter(|(_, &p)| !p)
            .map(|(e, _)| e.timestamp)
            .max()
            .expect("at least one summarized event");

        let mut out = Vec::with_capacity(events.len());
        let mut summary_emitted = false;
        for (event, &keep) in events.iter().zip(&preserved) {
            if keep {
                out.push(event.clone());
            } else if !summary_emitted {
                summary_emitted = true;
                out.push(ThreadEvent {
                    seq: 0,
                    thread_id: event.thread_id.clone(),
                    payload: EventPayload::CompactionSummary {
                        summary: digest.clone(),
                        replaced_range,
                    },
                    timestamp: summary_timestamp,
                });
            }
        }
        renumber(out)
    }
}

impl SummarizeStrategy {
    fn preserved_mask(&self, events: &[ThreadEvent]) -> Vec<bool> {
        let mut preserved = vec![false; events.len()];

        // Trailing window: everything from the Nth-from-last message event.
        let message_positions: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.payload.is_message())
            .map(|(i, _)| i)
            .collect();
        let window_start = if message_positions.len() > self.preserve_recent_events {
            message_positions[message_positions.len() - self.preserve_recent_events]
        } else {
            0
        };
        for slot in preserved.iter_mut().skip(window_start) {
            *slot = true;
        }

        // Prior summaries survive verbatim; re-digesting a digest loses
        // information and breaks compaction stability.
        for (i, e) in events.iter().enumerate() {
            if matches!(e.payload, EventPayload::CompactionSummary { .. }) {
                preserved[i] = true;
            }
        }

        if self.preserve_user_messages {
            for (i, e) in events.iter().enumerate() {
                if matches!(e.payload, EventPayload::UserMessage { .. }) {
                    preserved[i] = true;
                }
            }
            // Final agent message of each assistant turn.
            let mut last_agent: Option<usize> = None;
            for (i, e) in events.iter().enumerate() {
                match &e.payload {
                    EventPayload::AgentMessage { .. } => last_agent = Some(i),
                    EventPayload::UserMessage { .. } => {
                        if let Some(j) = last_agent.take() {
                            preserved[j] = true;
                        }
                    }
                    _ => {}
                }
            }
            if let Some(j) = last_agent {
                preserved[j] = true;
            }
        }

        preserved
    }
}

/// Drops everything outside the trailing window; no digest is produced.
#[derive(Debug, Clone)]
pub struct TruncateStrategy {
    pub keep_last: usize,
}

impl CompactionStrategy for TruncateStrategy {
    fn should_compact(&self, events: &[ThreadEvent], budget: &TokenBudget) -> bool {
        over_budget(events, budget)
    }

    fn compact(&self, events: &[ThreadEvent]) -> Vec<ThreadEvent> {
        if events.len() <= self.keep_last {
            return renumber(events.to_vec());
        }
        let mut preserved = vec![false; events.len()];
        let start = events.len() - self.keep_last;
        for slot in preserved.iter_mut().skip(start) {
            *slot = true;
        }
        demote_split_tool_pairs(events, &mut preserved);
        let kept = events
            .iter()
            .zip(&preserved)
            .filter(|(_, &p)| p)
            .map(|(e, _)| e.clone())
            .collect();
        renumber(kept)
    }
}

/// Enforce the pairing tie-break: a tool call and its result are kept or
/// dropped together.  A preserved event whose counterpart fell into the
/// summarized region is demoted; unpaired calls (no result at all) keep
/// whatever the window decided.
fn demote_split_tool_pairs(events: &[ThreadEvent], preserved: &mut [bool]) {
    let mut calls: HashMap<&str, usize> = HashMap::new();
    let mut results: HashMap<&str, usize> = HashMap::new();
    for (i, e) in events.iter().enumerate() {
        match &e.payload {
            EventPayload::ToolCall { call_id, .. } => {
                calls.insert(call_id.as_str(), i);
            }
            EventPayload::ToolResult { call_id, .. } => {
                results.insert(call_id.as_str(), i);
            }
            _ => {}
        }
    }
    for (call_id, &call_idx) in &calls {
        if let Some(&result_idx) = results.get(call_id) {
            if preserved[call_idx] != preserved[result_idx] {
                preserved[call_idx] = false;
                preserved[result_idx] = false;
            }
        }
    }
}

fn build_digest(events: &[ThreadEvent], preserved: &[bool]) -> CompactionDigest {
    let mut digest = CompactionDigest::default();
    for (e, &keep) in events.iter().zip(preserved) {
        if keep {
            continue;
        }
        *digest
            .event_counts
            .entry(e.payload.type_name().to_string())
            .or_insert(0) += 1;
        if let EventPayload::ToolCall { tool_name, .. } = &e.payload {
            *digest.tools_used.entry(tool_name.clone()).or_insert(0) += 1;
        }
        digest.first_timestamp = Some(match digest.first_timestamp {
            Some(t) => t.min(e.timestamp),
            None => e.timestamp,
        });
        digest.last_timestamp = Some(match digest.last_timestamp {
            Some(t) => t.max(e.timestamp),
            None => e.timestamp,
        });
    }
    digest
}

fn summarized_seq_range(events: &[ThreadEvent], preserved: &[bool]) -> [i64; 2] {
    let seqs: Vec<i64> = events
        .iter()
        .zip(preserved)
        .filter(|(_, &p)| !p)
        .map(|(e, _)| e.seq)
        .collect();
    [
        seqs.iter().copied().min().unwrap_or(0),
        seqs.iter().copied().max().unwrap_or(0),
    ]
}

/// Reassign dense 1-based sequence numbers; output threads get their own
/// timeline.
fn renumber(mut events: Vec<ThreadEvent>) -> Vec<ThreadEvent> {
    for (i, e) in events.iter_mut().enumerate() {
        e.seq = (i + 1) as i64;
    }
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lace_config::BudgetConfig;
    use serde_json::json;

    fn event(seq: i64, payload: EventPayload) -> ThreadEvent {
        ThreadEvent {
            seq,
            thread_id: "t".into(),
            payload,
            timestamp: Utc.timestamp_opt(1_700_000_000 + seq, 0).unwrap(),
        }
    }

    /// Alternating user/agent messages, `n` of them, ~400 chars each.
    fn chat(n: usize) -> Vec<ThreadEvent> {
        (0..n)
            .map(|i| {
                let text = format!("message {i} {}", "x".repeat(400));
                let payload = if i % 2 == 0 {
                    EventPayload::user(text)
                } else {
                    EventPayload::agent(text)
                };
                event(i as i64 + 1, payload)
            })
            .collect()
    }

    fn summarize(n_recent: usize, keep_users: bool) -> SummarizeStrategy {
        SummarizeStrategy {
            preserve_recent_events: n_recent,
            preserve_user_messages: keep_users,
        }
    }

    fn count_summaries(events: &[ThreadEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::CompactionSummary { .. }))
            .count()
    }

    // ── Trigger ───────────────────────────────────────────────────────────────

    #[test]
    fn should_compact_when_over_allowed_input() {
        let strategy = summarize(2, true);
        let small = TokenBudget::new(
            100,
            &BudgetConfig {
                response_reserve: 0,
                warn_fraction: 0.8,
            },
        );
        assert!(strategy.should_compact(&chat(15), &small));
        let huge = TokenBudget::new(1_000_000, &BudgetConfig::default());
        assert!(!strategy.should_compact(&chat(15), &huge));
    }

    // ── Summarize shape ───────────────────────────────────────────────────────

    #[test]
    fn empty_input_compacts_to_empty() {
        assert!(summarize(2, true).compact(&[]).is_empty());
    }

    #[test]
    fn small_thread_passes_through_unchanged() {
        let events = chat(3);
        let out = summarize(10, true).compact(&events);
        assert_eq!(out.len(), 3);
        assert_eq!(count_summaries(&out), 0);
    }

    #[test]
    fn old_events_collapse_into_one_summary() {
        let events = chat(15);
        let out = summarize(2, false).compact(&events);
        // 1 summary + the window holding the last 2 messages
        assert_eq!(out.len(), 3);
        assert_eq!(count_summaries(&out), 1);
        assert!(matches!(
            out[0].payload,
            EventPayload::CompactionSummary { .. }
        ));
    }

    #[test]
    fn preserve_user_messages_keeps_all_user_events() {
        let events = chat(15); // 8 user, 7 agent
        let out = summarize(2, true).compact(&events);
        let users = out
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::UserMessage { .. }))
            .count();
        assert_eq!(users, 8, "every user message survives");
        assert_eq!(count_summaries(&out), 1);
    }

    #[test]
    fn final_agent_message_per_turn_preserved() {
        // user, agent(mid), agent(final), user, agent(final)
        let events = vec![
            event(1, EventPayload::user("q1")),
            event(2, EventPayload::agent("working on it")),
            event(3, EventPayload::agent("answer 1")),
            event(4, EventPayload::user("q2")),
            event(5, EventPayload::agent("answer 2")),
        ];
        // Tiny window so only the preservation rules keep things.
        let out = summarize(1, true).compact(&events);
        let texts: Vec<&str> = out
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::AgentMessage { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert!(texts.contains(&"answer 1"), "turn-final reply kept");
        assert!(texts.contains(&"answer 2"));
        assert!(!texts.contains(&"working on it"), "mid-turn reply summarized");
    }

    #[test]
    fn digest_counts_types_tools_and_timestamps() {
        let mut events = chat(12);
        events.push(event(13, EventPayload::tool_call("grep", "c1", json!({"p": 1}))));
        events.push(event(14, EventPayload::tool_result("c1", "grep", "hit", false)));
        events.push(event(15, EventPayload::user("latest question")));
        events.push(event(16, EventPayload::agent("latest answer")));

        let out = summarize(2, false).compact(&events);
        let (digest, range) = out
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::CompactionSummary {
                    summary,
                    replaced_range,
                } => Some((summary.clone(), *replaced_range)),
                _ => None,
            })
            .expect("summary present");

        assert_eq!(digest.event_counts["user_message"], 6);
        assert_eq!(digest.event_counts["agent_message"], 6);
        assert_eq!(digest.event_counts["tool_call"], 1);
        assert_eq!(digest.tools_used["grep"], 1);
        assert_eq!(range, [1, 14]);
        assert!(digest.first_timestamp.unwrap() < digest.last_timestamp.unwrap());
    }

    #[test]
    fn output_seq_is_dense_from_one() {
        let out = summarize(2, false).compact(&chat(15));
        let seqs: Vec<i64> = out.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=out.len() as i64).collect::<Vec<_>>());
    }

    // ── Pairing tie-breaks ────────────────────────────────────────────────────

    #[test]
    fn pair_split_by_window_is_fully_summarized() {
        // The window starts at the result: its call is older. Both go.
        let mut events = chat(12);
        events.push(event(13, EventPayload::tool_call("slow", "c9", json!({}))));
        events.push(event(14, EventPayload::agent("tool dispatched")));
        events.push(event(15, EventPayload::tool_result("c9", "slow", "out", false)));
        events.push(event(16, EventPayload::user("next")));
        events.push(event(17, EventPayload::agent("reply")));

        // Window = last 3 messages: "tool dispatched"(14) onwards — the
        // result (15) is inside, its call (13) is not.
        let out = summarize(3, false).compact(&events);
        assert!(
            !out.iter().any(|e| e.payload.call_id() == Some("c9")),
            "split pair must be summarized on both sides"
        );
    }

    #[test]
    fn intact_pair_inside_window_is_kept() {
        let mut events = chat(12);
        events.push(event(13, EventPayload::user("do it")));
        events.push(event(14, EventPayload::tool_call("grep", "c1", json!({}))));
        events.push(event(15, EventPayload::tool_result("c1", "grep", "ok", false)));
        events.push(event(16, EventPayload::agent("done")));

        let out = summarize(2, false).compact(&events);
        let call_ids: Vec<Option<&str>> = out.iter().map(|e| e.payload.call_id()).collect();
        assert!(call_ids.contains(&Some("c1")));
        assert_eq!(
            out.iter().filter(|e| e.payload.call_id() == Some("c1")).count(),
            2,
            "both halves of the pair survive"
        );
    }

    // ── Stability ─────────────────────────────────────────────────────────────

    #[test]
    fn compaction_is_idempotent_under_same_config() {
        let strategy = summarize(2, true);
        let once = strategy.compact(&chat(15));
        let twice = strategy.compact(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn earlier_summaries_are_never_redigested() {
        let strategy = summarize(2, false);
        let once = strategy.compact(&chat(15));
        assert_eq!(count_summaries(&once), 1);
        // Grow the thread and compact again: the old digest must survive.
        let mut grown = once.clone();
        let base = grown.len() as i64;
        for (i, e) in chat(8).into_iter().enumerate() {
            grown.push(ThreadEvent {
                seq: base + i as i64 + 1,
                ..e
            });
        }
        let again = strategy.compact(&grown);
        assert_eq!(count_summaries(&again), 2, "old + new digest");
    }

    // ── Truncate ──────────────────────────────────────────────────────────────

    #[test]
    fn truncate_keeps_only_the_tail() {
        let out = TruncateStrategy { keep_last: 4 }.compact(&chat(15));
        assert_eq!(out.len(), 4);
        assert_eq!(count_summaries(&out), 0);
        assert!(matches!(
            &out[3].payload,
            EventPayload::UserMessage { content } if content.starts_with("message 14")
        ));
    }

    #[test]
    fn truncate_short_input_unchanged() {
        let out = TruncateStrategy { keep_last: 10 }.compact(&chat(3));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn truncate_respects_pairing_at_the_boundary() {
        let mut events = chat(4);
        events.push(event(5, EventPayload::tool_call("grep", "c1", json!({}))));
        events.push(event(6, EventPayload::tool_result("c1", "grep", "ok", false)));
        // keep_last = 1 keeps only the result; the tie-break drops it too.
        let out = TruncateStrategy { keep_last: 1 }.compact(&events);
        assert!(!out.iter().any(|e| e.payload.call_id() == Some("c1")));
    }
}
