// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios for the agent runtime.
//!
//! Uses the scripted mock provider so every scenario is deterministic and
//! requires no network access.
#[cfg(test)]
mod runtime_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use lace_config::{AgentConfig, BudgetConfig, ExecutorConfig};
    use lace_model::{ModelProvider, ScriptedProvider, StopReason, StreamEvent, Usage};
    use lace_store::{Database, EventPayload, ThreadStore};
    use lace_tools::{Tool, ToolContext, ToolError, ToolExecutor, ToolRegistry};

    use crate::{
        activity::ActivityLog,
        agent::Agent,
        budget::TokenBudget,
        compact::{CompactionStrategy, SummarizeStrategy},
        events::{AgentEvent, TurnState},
        queue::{MessagePriority, MessageQueue, QueuedMessage},
    };

    // ── Test tools ────────────────────────────────────────────────────────────

    /// Sleeps for a fixed delay, then reports.
    struct SlowTool {
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "a slow operation"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok("slow done".into())
        }
    }

    /// Requires an integer `a`; used by the stop-reason repair scenario.
    struct AdderTool;

    #[async_trait]
    impl Tool for AdderTool {
        fn name(&self) -> &str {
            "adder"
        }
        fn description(&self) -> &str {
            "adds things"
        }
        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "a": { "type": "integer" } },
                "required": ["a"]
            })
        }
        async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            Ok(format!("sum: {}", input["a"]))
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Bed {
        store: Arc<ThreadStore>,
        activity: ActivityLog,
    }

    fn bed() -> Bed {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(ThreadStore::new(db));
        store.create_thread("sess").unwrap();
        store.create_thread("sess.1").unwrap();
        Bed {
            store,
            activity: ActivityLog::new(),
        }
    }

    fn fast_executor_cfg() -> ExecutorConfig {
        ExecutorConfig {
            max_retries: 0,
            retry_base_ms: 1,
            tool_timeout_secs: 30,
            ..Default::default()
        }
    }

    fn make_agent(
        bed: &Bed,
        provider: impl ModelProvider + 'static,
        registry: ToolRegistry,
        window: usize,
        strategy: Arc<dyn CompactionStrategy>,
    ) -> Agent {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let executor =
            ToolExecutor::new(Arc::new(registry), &fast_executor_cfg()).with_events(exec_tx);
        let queue = Arc::new(MessageQueue::new(100, "sess.1", bed.activity.clone()));
        Agent::new(
            "worker",
            "sess",
            "sess.1",
            Arc::clone(&bed.store),
            Arc::new(provider),
            Arc::new(executor),
            exec_rx,
            TokenBudget::new(
                window,
                &BudgetConfig {
                    response_reserve: 0,
                    warn_fraction: 0.8,
                },
            ),
            strategy,
            queue,
            bed.activity.clone(),
            Arc::new(AgentConfig::default()),
            3,
        )
        .unwrap()
    }

    fn default_strategy() -> Arc<dyn CompactionStrategy> {
        Arc::new(SummarizeStrategy::default())
    }

    /// Collect events until the channel closes.
    async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn final_event(stop: StopReason) -> StreamEvent {
        StreamEvent::Final {
            stop_reason: stop,
            usage: Usage::default(),
        }
    }

    // ── Basic turn ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn text_turn_appends_user_and_agent_events() {
        let bed = bed();
        let mut agent = make_agent(
            &bed,
            ScriptedProvider::always_text("hello there"),
            ToolRegistry::new(),
            100_000,
            default_strategy(),
        );
        let (tx, rx) = mpsc::channel(256);
        agent.submit("hi", tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::TokenDelta(t) if t.contains("hello"))));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::MessageComplete(t) if t == "hello there")));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::TurnComplete)));

        let log = bed.store.events("sess.1").unwrap();
        assert!(log
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::UserMessage { content } if content == "hi")));
        assert!(log.iter().any(
            |e| matches!(&e.payload, EventPayload::AgentMessage { content } if content == "hello there")
        ));
        assert_eq!(agent.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn seq_is_dense_after_a_full_turn() {
        let bed = bed();
        let mut agent = make_agent(
            &bed,
            ScriptedProvider::tool_then_text("c1", "slow", "{}", "done"),
            {
                let mut r = ToolRegistry::new();
                r.register(SlowTool { delay_ms: 1 });
                r
            },
            100_000,
            default_strategy(),
        );
        let (tx, rx) = mpsc::channel(256);
        agent.submit("go", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let log = bed.store.events("sess.1").unwrap();
        let seqs: Vec<i64> = log.iter().map(|e| e.seq).collect();
        let expected: Vec<i64> = (1..=log.len() as i64).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn every_tool_call_gets_a_result_with_matching_id() {
        let bed = bed();
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool { delay_ms: 1 });
        let mut agent = make_agent(
            &bed,
            ScriptedProvider::tool_then_text("call-77", "slow", "{}", "done"),
            registry,
            100_000,
            default_strategy(),
        );
        let (tx, rx) = mpsc::channel(256);
        agent.submit("go", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let log = bed.store.events("sess.1").unwrap();
        let calls: Vec<&str> = log
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ToolCall { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        let results: Vec<&str> = log
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec!["call-77"]);
        assert_eq!(results, vec!["call-77"]);
    }

    // ── Seed: compaction under growth ─────────────────────────────────────────

    #[tokio::test]
    async fn compaction_under_growth_creates_shadow_thread() {
        let bed = bed();
        // ~100 tokens per message, 15 messages ≈ 1500 tokens in a
        // 1000-token window.
        for i in 0..15 {
            let text = format!("message {i} {}", "x".repeat(400));
            let payload = if i % 2 == 0 {
                EventPayload::user(text)
            } else {
                EventPayload::agent(text)
            };
            bed.store.append("sess.1", payload).unwrap();
        }

        let strategy = Arc::new(SummarizeStrategy {
            preserve_recent_events: 2,
            preserve_user_messages: false,
        });
        let mut agent = make_agent(
            &bed,
            ScriptedProvider::always_text("ok"),
            ToolRegistry::new(),
            1000,
            strategy,
        );
        let (tx, rx) = mpsc::channel(256);
        agent.submit("what next?", tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Compacted { .. })));

        // The canonical id survives; a new physical thread backs it.
        let thread = bed.store.get_or_load("sess.1").unwrap();
        assert_eq!(thread.canonical_id, "sess.1");
        assert_ne!(thread.id, "sess.1");
        assert_eq!(bed.store.get_canonical_id(&thread.id).unwrap(), "sess.1");

        // Compacted prefix: one digest + the two preserved messages, then
        // the new user message.
        let summaries = thread
            .events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::CompactionSummary { .. }))
            .count();
        assert_eq!(summaries, 1);
        assert!(matches!(
            thread.events[0].payload,
            EventPayload::CompactionSummary { .. }
        ));
        assert!(matches!(
            &thread.events[1].payload,
            EventPayload::AgentMessage { content } if content.starts_with("message 13")
        ));
        assert!(matches!(
            &thread.events[2].payload,
            EventPayload::UserMessage { content } if content.starts_with("message 14")
        ));
        assert!(matches!(
            &thread.events[3].payload,
            EventPayload::UserMessage { content } if content == "what next?"
        ));

        // The old physical thread still holds the full history.
        assert_eq!(bed.store.db().load_events("sess.1").unwrap().len(), 15);
    }

    // ── Seed: stop-reason repair ──────────────────────────────────────────────

    #[tokio::test]
    async fn max_tokens_drops_incomplete_tool_calls() {
        let bed = bed();
        let provider = ScriptedProvider::new(vec![
            vec![
                StreamEvent::TokenDelta("Partial".into()),
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: "c-ok".into(),
                    name: "adder".into(),
                    arguments: r#"{"a":1}"#.into(),
                },
                StreamEvent::ToolCallDelta {
                    index: 1,
                    id: "c-cut".into(),
                    name: "adder".into(),
                    arguments: r#"{"a":"#.into(),
                },
                final_event(StopReason::MaxTokens),
            ],
            vec![
                StreamEvent::TokenDelta("continuing".into()),
                final_event(StopReason::EndTurn),
            ],
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(AdderTool);
        let mut agent = make_agent(&bed, provider, registry, 100_000, default_strategy());
        let (tx, rx) = mpsc::channel(256);
        agent.submit("add", tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::TokenExhaustion { dropped_calls: 1 })));

        let log = bed.store.events("sess.1").unwrap();
        let calls: Vec<&str> = log
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ToolCall { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec!["c-ok"], "only the complete call proceeds");
        assert!(log.iter().any(
            |e| matches!(&e.payload, EventPayload::ToolResult { call_id, .. } if call_id == "c-ok")
        ));
    }

    #[tokio::test]
    async fn max_tokens_with_single_incomplete_call_ends_text_only() {
        let bed = bed();
        let provider = ScriptedProvider::new(vec![vec![
            StreamEvent::TokenDelta("Partial".into()),
            StreamEvent::ToolCallDelta {
                index: 0,
                id: "c-cut".into(),
                name: "adder".into(),
                arguments: r#"{"a"#.into(),
            },
            final_event(StopReason::MaxTokens),
        ]]);
        let mut registry = ToolRegistry::new();
        registry.register(AdderTool);
        let mut agent = make_agent(&bed, provider, registry, 100_000, default_strategy());
        let (tx, rx) = mpsc::channel(256);
        agent.submit("add", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let log = bed.store.events("sess.1").unwrap();
        let tool_calls = log
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::ToolCall { .. }))
            .count();
        assert_eq!(tool_calls, 0);
        assert!(log.iter().any(
            |e| matches!(&e.payload, EventPayload::AgentMessage { content } if content == "Partial")
        ));
        assert_eq!(agent.state(), TurnState::Idle);
    }

    // ── Seed: queue while busy ────────────────────────────────────────────────

    #[tokio::test]
    async fn queued_messages_drain_in_priority_order_as_new_turns() {
        let bed = bed();
        let provider = ScriptedProvider::new(vec![
            // Turn 1: one slow tool call, then text.
            vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: "c1".into(),
                    name: "slow".into(),
                    arguments: "{}".into(),
                },
                final_event(StopReason::ToolUse),
            ],
            vec![
                StreamEvent::TokenDelta("turn1 done".into()),
                final_event(StopReason::EndTurn),
            ],
            // Turns for the three queued messages.
            vec![
                StreamEvent::TokenDelta("turn2".into()),
                final_event(StopReason::EndTurn),
            ],
            vec![
                StreamEvent::TokenDelta("turn3".into()),
                final_event(StopReason::EndTurn),
            ],
            vec![
                StreamEvent::TokenDelta("turn4".into()),
                final_event(StopReason::EndTurn),
            ],
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool { delay_ms: 500 });
        let mut agent = make_agent(&bed, provider, registry, 100_000, default_strategy());
        let queue = agent.queue();

        let (tx, rx) = mpsc::channel(1024);
        let worker = tokio::spawn(async move {
            agent.submit("start long job", tx).await.unwrap();
            agent
        });

        // Enqueue while the slow tool is still running.
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.enqueue(QueuedMessage::user("M1"));
        queue.enqueue(QueuedMessage::user("M2").with_priority(MessagePriority::High));
        queue.enqueue(QueuedMessage::user("M3"));

        let agent = worker.await.unwrap();
        let _ = collect_events(rx).await;

        let log = bed.store.events("sess.1").unwrap();
        let users: Vec<&str> = log
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::UserMessage { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(users, vec!["start long job", "M2", "M1", "M3"]);
        assert!(agent.queue().is_empty(), "queue fully drained");
    }

    // ── Seed: cancellation mid-tool ───────────────────────────────────────────

    #[tokio::test]
    async fn cancellation_mid_tool_synthesizes_error_results() {
        let bed = bed();
        let provider = ScriptedProvider::new(vec![vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: "c1".into(),
                name: "slow".into(),
                arguments: "{}".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 1,
                id: "c2".into(),
                name: "slow".into(),
                arguments: "{}".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 2,
                id: "c3".into(),
                name: "slow".into(),
                arguments: "{}".into(),
            },
            final_event(StopReason::ToolUse),
        ]]);
        let call_count = provider.call_count.clone();
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool { delay_ms: 5000 });
        let mut agent = make_agent(&bed, provider, registry, 100_000, default_strategy());

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let (tx, rx) = mpsc::channel(1024);
        let worker = tokio::spawn(async move {
            let _ = agent.submit_with_cancel("run all three", tx, cancel2).await;
            agent
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let agent = worker.await.unwrap();
        let events = collect_events(rx).await;

        let log = bed.store.events("sess.1").unwrap();
        let results: Vec<(&str, bool, &str)> = log
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ToolResult {
                    call_id,
                    result,
                    is_error,
                    ..
                } => Some((call_id.as_str(), *is_error, result.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 3, "one synthetic result per dispatched call");
        for (call_id, is_error, content) in &results {
            assert!(["c1", "c2", "c3"].contains(call_id));
            assert!(is_error);
            assert!(content.contains("cancelled"));
        }
        assert!(log.iter().any(|e| matches!(
            &e.payload,
            EventPayload::LocalSystemMessage { message } if message.contains("cancelled")
        )));
        assert_eq!(agent.state(), TurnState::Idle);
        assert_eq!(
            *call_count.lock().unwrap(),
            1,
            "no further provider call after cancellation"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Aborted { .. })));
    }

    // ── State machine & activity ──────────────────────────────────────────────

    #[tokio::test]
    async fn state_transitions_follow_the_table() {
        let bed = bed();
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool { delay_ms: 1 });
        let mut agent = make_agent(
            &bed,
            ScriptedProvider::tool_then_text("c1", "slow", "{}", "done"),
            registry,
            100_000,
            default_strategy(),
        );
        let (tx, rx) = mpsc::channel(1024);
        agent.submit("go", tx).await.unwrap();
        let events = collect_events(rx).await;

        let transitions: Vec<(TurnState, TurnState)> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::StateChange { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(transitions.first(), Some(&(TurnState::Idle, TurnState::Thinking)));
        assert!(transitions.contains(&(TurnState::Streaming, TurnState::ToolExecution)));
        assert_eq!(transitions.last().map(|t| t.1), Some(TurnState::Idle));
    }

    #[tokio::test]
    async fn budget_warning_emitted_when_near_limit() {
        let bed = bed();
        // 60-token window, ~50-token history → warn (≥80%) but not block.
        bed.store
            .append("sess.1", EventPayload::user("y".repeat(200)))
            .unwrap();
        let mut agent = make_agent(
            &bed,
            ScriptedProvider::always_text("ok"),
            ToolRegistry::new(),
            60,
            default_strategy(),
        );
        let (tx, rx) = mpsc::channel(256);
        agent.submit("q", tx).await.unwrap();
        let events = collect_events(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::BudgetWarning { .. })));
    }

    #[tokio::test]
    async fn activity_stream_sees_tool_and_state_events() {
        let bed = bed();
        let mut activity_rx = bed.activity.subscribe();
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool { delay_ms: 1 });
        let mut agent = make_agent(
            &bed,
            ScriptedProvider::tool_then_text("c1", "slow", "{}", "done"),
            registry,
            100_000,
            default_strategy(),
        );
        let (tx, rx) = mpsc::channel(1024);
        agent.submit("go", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let mut kinds = Vec::new();
        while let Ok(ev) = activity_rx.try_recv() {
            kinds.push(ev.kind);
        }
        use crate::events::ActivityKind::*;
        for expected in [StateChange, Message, ToolCall, ToolResult] {
            assert!(kinds.contains(&expected), "missing {expected:?} in {kinds:?}");
        }
    }

    #[tokio::test]
    async fn turn_deadline_aborts_with_timeout_notice() {
        let bed = bed();
        let provider = ScriptedProvider::new(vec![vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: "c1".into(),
                name: "slow".into(),
                arguments: "{}".into(),
            },
            final_event(StopReason::ToolUse),
        ]]);
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool { delay_ms: 10_000 });

        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let executor =
            ToolExecutor::new(Arc::new(registry), &fast_executor_cfg()).with_events(exec_tx);
        let queue = Arc::new(MessageQueue::new(100, "sess.1", bed.activity.clone()));
        let mut agent = Agent::new(
            "worker",
            "sess",
            "sess.1",
            Arc::clone(&bed.store),
            Arc::new(provider),
            Arc::new(executor),
            exec_rx,
            TokenBudget::new(100_000, &BudgetConfig::default()),
            default_strategy(),
            queue,
            bed.activity.clone(),
            Arc::new(AgentConfig {
                turn_timeout_secs: Some(1),
                ..Default::default()
            }),
            3,
        )
        .unwrap();

        let (tx, rx) = mpsc::channel(1024);
        agent.submit("slow work", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let log = bed.store.events("sess.1").unwrap();
        assert!(log.iter().any(|e| matches!(
            &e.payload,
            EventPayload::LocalSystemMessage { message } if message.contains("deadline")
        )));
        assert!(log.iter().any(|e| matches!(
            &e.payload,
            EventPayload::ToolResult { result, is_error: true, .. } if result.contains("timeout")
        )));
        assert_eq!(agent.state(), TurnState::Idle);
    }
}
