// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lace_config::AgentConfig;
use lace_model::{
    ChatRequest, Message, ModelProvider, StopReason, StreamEvent, ToolCallAccumulator,
    ToolCallRequest,
};
use lace_store::{EventPayload, StoreError, ThreadEvent, ThreadStore};
use lace_tools::{ExecutorEvent, ToolCall, ToolContext, ToolExecutor};

use crate::{
    activity::ActivityLog,
    budget::TokenBudget,
    compact::CompactionStrategy,
    conversation::build_conversation,
    events::{ActivityKind, AgentEvent, TurnState},
    queue::MessageQueue,
};

/// The per-thread runtime: drives the turn state machine
/// `idle → thinking → streaming → tool_execution → … → idle`, persisting
/// every step as thread events and emitting observable events along the way.
pub struct Agent {
    name: String,
    session_id: String,
    /// Stable external identity of the conversation.
    canonical_id: String,
    /// Physical thread receiving appends; replaced on compaction.
    thread_id: String,
    store: Arc<ThreadStore>,
    provider: Arc<dyn ModelProvider>,
    executor: Arc<ToolExecutor>,
    /// Receives retry/circuit signals raised inside the executor.  The
    /// paired sender was given to the executor at construction.
    executor_events: mpsc::UnboundedReceiver<ExecutorEvent>,
    budget: TokenBudget,
    strategy: Arc<dyn CompactionStrategy>,
    queue: Arc<MessageQueue>,
    activity: ActivityLog,
    config: Arc<AgentConfig>,
    keep_shadows: usize,
    system_prompt: Option<String>,
    state: TurnState,
}

/// Outcome of one streaming round against the provider.
enum RoundOutcome {
    Complete {
        text: String,
        stop_reason: StopReason,
        tool_calls: Vec<ToolCallRequest>,
    },
    Aborted {
        partial_text: String,
    },
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        session_id: impl Into<String>,
        thread_id: impl Into<String>,
        store: Arc<ThreadStore>,
        provider: Arc<dyn ModelProvider>,
        executor: Arc<ToolExecutor>,
        executor_events: mpsc::UnboundedReceiver<ExecutorEvent>,
        budget: TokenBudget,
        strategy: Arc<dyn CompactionStrategy>,
        queue: Arc<MessageQueue>,
        activity: ActivityLog,
        config: Arc<AgentConfig>,
        keep_shadows: usize,
    ) -> anyhow::Result<Self> {
        let canonical_id = thread_id.into();
        let thread_id = store.resolve_physical(&canonical_id)?;
        Ok(Self {
            name: name.into(),
            session_id: session_id.into(),
            canonical_id,
            thread_id,
            store,
            provider,
            executor,
            executor_events,
            budget,
            strategy,
            queue,
            activity,
            config,
            keep_shadows,
            system_prompt: None,
            state: TurnState::Idle,
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    /// Physical thread currently receiving appends.
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle other tasks use to enqueue messages while this agent
    /// is busy.
    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    /// Run one user turn, then drain the message queue: every queued
    /// message becomes its own turn, high-priority first.
    pub async fn submit(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        self.submit_with_cancel(user_input, tx, CancellationToken::new())
            .await
    }

    /// Like [`submit`] but driven by an external cancellation token.
    ///
    /// Cancelling aborts the provider stream and the in-flight tool batch;
    /// the runtime appends synthetic error results for any dispatched tool
    /// calls plus a local system notice, then returns to idle.
    ///
    /// [`submit`]: Agent::submit
    pub async fn submit_with_cancel(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let timed_out = Arc::new(AtomicBool::new(false));
        let deadline_guard = self.config.turn_timeout_secs.map(|secs| {
            let token = cancel.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let mut result = self
            .run_turn(user_input, &tx, &cancel, &timed_out)
            .await;

        // Queue drain: consumption only happens at idle, one turn per
        // message, high-priority first.
        if result.is_ok() && !cancel.is_cancelled() && !self.queue.is_empty() {
            self.activity.emit_kind(
                ActivityKind::QueueProcessingStart,
                &self.canonical_id,
                json!({ "length": self.queue.len() }),
            );
            let mut processed = 0usize;
            while let Some(msg) = self.queue.pop() {
                if cancel.is_cancelled() {
                    break;
                }
                debug!(agent = %self.name, id = %msg.id, "processing queued message");
                result = self.run_turn(&msg.content, &tx, &cancel, &timed_out).await;
                if result.is_err() {
                    break;
                }
                processed += 1;
            }
            self.activity.emit_kind(
                ActivityKind::QueueProcessingComplete,
                &self.canonical_id,
                json!({ "processed": processed }),
            );
        }

        if let Some(guard) = deadline_guard {
            guard.abort();
        }
        if result.is_ok() {
            let _ = tx.send(AgentEvent::TurnComplete).await;
        }
        result
    }

    /// One full turn for one user message.
    async fn run_turn(
        &mut self,
        user_input: &str,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        timed_out: &AtomicBool,
    ) -> anyhow::Result<()> {
        self.set_state(TurnState::Thinking, tx).await;

        // Step 1: budget gate, compacting into a fresh physical thread when
        // the next request would overflow.
        let pending = Message::user(user_input).approx_tokens();
        if let Err(e) = self.maybe_compact(tx, pending).await {
            return self.abort_turn(tx, e).await;
        }

        if let Err(e) = self.append(EventPayload::user(user_input)) {
            return self.abort_turn(tx, e.into()).await;
        }
        self.activity.emit_kind(
            ActivityKind::Message,
            &self.canonical_id,
            json!({ "role": "user", "content": user_input }),
        );

        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                warn!(agent = %self.name, rounds, "tool-round budget exhausted");
                let _ = self.append(EventPayload::local_system(format!(
                    "Stopped after {} tool rounds without reaching a final answer.",
                    self.config.max_tool_rounds
                )));
                break;
            }

            if cancel.is_cancelled() {
                return self.finish_cancelled(tx, String::new(), timed_out).await;
            }

            // Mid-loop budget gate: tool results may have grown the thread.
            if rounds > 1 {
                if let Err(e) = self.maybe_compact(tx, 0).await {
                    return self.abort_turn(tx, e).await;
                }
            }

            // Step 2: fold events into the provider request.
            let events = match self.store.events(&self.thread_id) {
                Ok(ev) => ev,
                Err(e) => return self.abort_turn(tx, e.into()).await,
            };
            let messages = build_conversation(self.system_prompt.as_deref(), &events);

            let estimated = self.budget.estimate(self.provider.as_ref(), &messages);
            if self.budget.should_warn(estimated) {
                let allowed = self.budget.allowed_input();
                let _ = tx
                    .send(AgentEvent::BudgetWarning { estimated, allowed })
                    .await;
                self.activity.emit_kind(
                    ActivityKind::TokenBudgetWarning,
                    &self.canonical_id,
                    json!({ "estimated": estimated, "allowed": allowed }),
                );
            }

            // Step 3: dispatch, streaming tokens to subscribers.
            let _ = self.append(EventPayload::Thinking {
                status: lace_store::ThinkingStatus::Start,
            });
            let outcome = self.stream_one_round(messages, tx, cancel).await;
            let _ = self.append(EventPayload::Thinking {
                status: lace_store::ThinkingStatus::Complete,
            });

            let (text, stop_reason, tool_calls) = match outcome {
                Ok(RoundOutcome::Complete {
                    text,
                    stop_reason,
                    tool_calls,
                }) => (text, stop_reason, tool_calls),
                Ok(RoundOutcome::Aborted { partial_text }) => {
                    if !partial_text.is_empty() {
                        let _ = self.append(EventPayload::agent(&partial_text));
                    }
                    return self.finish_cancelled(tx, partial_text, timed_out).await;
                }
                Err(e) => return self.abort_turn(tx, e).await,
            };

            if !text.is_empty() {
                if let Err(e) = self.append(EventPayload::agent(&text)) {
                    return self.abort_turn(tx, e.into()).await;
                }
                let _ = tx.send(AgentEvent::MessageComplete(text.clone())).await;
                self.activity.emit_kind(
                    ActivityKind::Message,
                    &self.canonical_id,
                    json!({ "role": "assistant", "content": text }),
                );
            }

            // Step 4: stop-reason repair.  On max_tokens the trailing tool
            // call is often cut mid-arguments; only schema-valid calls may
            // proceed.
            let tool_calls = if stop_reason == StopReason::MaxTokens {
                self.repair_exhausted_calls(tool_calls, tx).await
            } else {
                tool_calls
            };

            if tool_calls.is_empty() {
                break;
            }

            // Step 5: tool phase.
            self.set_state(TurnState::ToolExecution, tx).await;
            if let Err(e) = self
                .run_tool_phase(tool_calls, tx, cancel, timed_out)
                .await
            {
                return self.abort_turn(tx, e).await;
            }
            if cancel.is_cancelled() {
                return self.finish_cancelled(tx, String::new(), timed_out).await;
            }
            self.set_state(TurnState::Thinking, tx).await;
        }

        // Step 6: idle transition; the caller drains the queue.
        self.set_state(TurnState::Idle, tx).await;
        Ok(())
    }

    /// Call the provider once, streaming deltas and accumulating tool calls.
    async fn stream_one_round(
        &mut self,
        messages: Vec<Message>,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RoundOutcome> {
        let req = ChatRequest {
            messages,
            tools: self
                .executor
                .registry()
                .schemas()
                .into_iter()
                .map(|s| lace_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect(),
            ..Default::default()
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(RoundOutcome::Aborted { partial_text: String::new() });
            }
            result = self.provider.chat_stream(req) => {
                result.context("provider dispatch failed")?
            }
        };

        let mut text = String::new();
        let mut acc = ToolCallAccumulator::default();
        let mut stop_reason = StopReason::EndTurn;
        let mut streaming = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(RoundOutcome::Aborted { partial_text: text });
                }
                ev = stream.next() => ev,
            };
            match event {
                None => break,
                Some(Err(e)) => return Err(e.context("provider stream failed")),
                Some(Ok(StreamEvent::TokenDelta(delta))) => {
                    if !streaming {
                        streaming = true;
                        self.set_state(TurnState::Streaming, tx).await;
                    }
                    text.push_str(&delta);
                    let _ = tx.send(AgentEvent::TokenDelta(delta.clone())).await;
                    self.activity.emit_kind(
                        ActivityKind::Token,
                        &self.canonical_id,
                        json!({ "token": delta }),
                    );
                }
                Some(Ok(StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                })) => {
                    if !streaming {
                        streaming = true;
                        self.set_state(TurnState::Streaming, tx).await;
                    }
                    acc.push(index, id, name, arguments);
                }
                Some(Ok(StreamEvent::Final {
                    stop_reason: sr,
                    usage,
                })) => {
                    self.budget.record_usage(usage.input_tokens, usage.output_tokens);
                    stop_reason = sr;
                }
            }
        }

        Ok(RoundOutcome::Complete {
            text,
            stop_reason,
            tool_calls: acc.finish(),
        })
    }

    /// Drop tool calls whose arguments do not validate against the tool's
    /// declared schema — after a `max_tokens` stop they are almost always
    /// truncated mid-JSON.  The surviving calls proceed normally.
    async fn repair_exhausted_calls(
        &mut self,
        calls: Vec<ToolCallRequest>,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Vec<ToolCallRequest> {
        let before = calls.len();
        let registry = self.executor.registry();
        let surviving: Vec<ToolCallRequest> = calls
            .into_iter()
            .filter(|c| match registry.get(&c.name) {
                Some(tool) => {
                    lace_tools::schema::validate(&tool.input_schema(), &c.arguments).is_ok()
                }
                None => false,
            })
            .collect();
        let dropped = before - surviving.len();
        warn!(
            agent = %self.name,
            dropped,
            surviving = surviving.len(),
            "response hit max_tokens; repaired tool calls"
        );
        let _ = tx
            .send(AgentEvent::TokenExhaustion {
                dropped_calls: dropped,
            })
            .await;
        self.activity.emit_kind(
            ActivityKind::TokenExhaustion,
            &self.canonical_id,
            json!({ "dropped_calls": dropped }),
        );
        surviving
    }

    /// Append `tool_call` events, dispatch the batch, append `tool_result`
    /// events — same call ids on both sides.
    async fn run_tool_phase(
        &mut self,
        requests: Vec<ToolCallRequest>,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        timed_out: &AtomicBool,
    ) -> anyhow::Result<()> {
        let calls: Vec<ToolCall> = requests
            .iter()
            .map(|r| ToolCall::new(&r.id, &r.name, r.arguments.clone()))
            .collect();

        for call in &calls {
            self.append(EventPayload::tool_call(
                &call.name,
                &call.id,
                call.input.clone(),
            ))?;
            let _ = tx
                .send(AgentEvent::ToolCallStarted {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;
            self.activity.emit_kind(
                ActivityKind::ToolCall,
                &self.canonical_id,
                json!({ "call_id": call.id, "tool": call.name }),
            );
        }

        let ctx = ToolContext {
            thread_id: self.canonical_id.clone(),
            session_id: self.session_id.clone(),
            agent_name: self.name.clone(),
            working_directory: std::env::current_dir().unwrap_or_default(),
            process_env: std::env::vars().collect(),
            signal: cancel.child_token(),
            sandbox: None,
        };
        let results = self.executor.execute_many(&calls, &ctx).await;
        self.forward_executor_events();

        for (call, result) in calls.iter().zip(results.iter()) {
            // A deadline expiry reaches the tools as plain cancellation;
            // relabel so the event log reflects the timeout taxonomy.
            let content = if timed_out.load(Ordering::SeqCst)
                && result.metadata.category == Some(lace_tools::ErrorCategory::Cancelled)
            {
                format!("timeout: turn deadline exceeded ({})", result.content)
            } else {
                result.content.clone()
            };
            self.append(EventPayload::tool_result(
                &call.id,
                &call.name,
                &content,
                result.is_error,
            ))?;
            let _ = tx
                .send(AgentEvent::ToolCallFinished {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: content.clone(),
                    is_error: result.is_error,
                })
                .await;
            self.activity.emit_kind(
                ActivityKind::ToolResult,
                &self.canonical_id,
                json!({
                    "call_id": call.id,
                    "tool": call.name,
                    "is_error": result.is_error,
                    "category": result.metadata.category.map(|c| c.as_str()),
                    "retry_attempts": result.metadata.retry_attempts,
                    "sequential_fallback": result.metadata.sequential_fallback,
                }),
            );
        }
        Ok(())
    }

    /// Budget gate: when the thread no longer fits, write the compacted
    /// event list into a new physical thread, swap the canonical mapping,
    /// and continue there.
    async fn maybe_compact(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        pending_tokens: usize,
    ) -> anyhow::Result<()> {
        let events = self.store.events(&self.thread_id)?;
        if events.is_empty() {
            return Ok(());
        }
        let messages = build_conversation(self.system_prompt.as_deref(), &events);
        let estimated = self.budget.estimate(self.provider.as_ref(), &messages) + pending_tokens;
        let must_compact = self.budget.should_block(estimated)
            || self.strategy.should_compact(&events, &self.budget);
        if !must_compact {
            return Ok(());
        }

        let before = events.len();
        let compacted = self.strategy.compact(&events);
        if compacted.len() >= before {
            // Nothing summarizable; blocking without recourse is surfaced
            // to the caller as a budget warning instead of a silent loop.
            warn!(agent = %self.name, "budget exceeded but nothing compactable");
            return Ok(());
        }
        let after = compacted.len();
        let payloads: Vec<EventPayload> =
            compacted.into_iter().map(|e: ThreadEvent| e.payload).collect();

        let new_id =
            self.store
                .create_version_thread(&self.canonical_id, payloads, "compaction")?;
        self.thread_id = new_id.clone();
        self.store
            .cleanup_old_shadows(&self.canonical_id, self.keep_shadows)?;

        debug!(
            agent = %self.name,
            canonical = %self.canonical_id,
            new_thread = %new_id,
            before,
            after,
            "thread compacted"
        );
        let _ = tx
            .send(AgentEvent::Compacted {
                events_before: before,
                events_after: after,
                new_thread_id: new_id.clone(),
            })
            .await;
        self.activity.emit_kind(
            ActivityKind::Compaction,
            &self.canonical_id,
            json!({ "events_before": before, "events_after": after, "new_thread_id": new_id }),
        );
        Ok(())
    }

    /// Cancellation epilogue: local notice, idle state, `Aborted` event.
    /// Tool results for in-flight calls were already appended by the tool
    /// phase, so the log pairing invariants hold.
    async fn finish_cancelled(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        partial_text: String,
        timed_out: &AtomicBool,
    ) -> anyhow::Result<()> {
        let notice = if timed_out.load(Ordering::SeqCst) {
            "Turn aborted: deadline exceeded."
        } else {
            "Turn cancelled by user."
        };
        let _ = self.append(EventPayload::local_system(notice));
        self.set_state(TurnState::Idle, tx).await;
        let _ = tx.send(AgentEvent::Aborted { partial_text }).await;
        Ok(())
    }

    /// Agent-level failure epilogue: storage or fatal provider errors end
    /// the turn with a local notice and return the agent to idle; the
    /// session outlives the failure.
    async fn abort_turn(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        err: anyhow::Error,
    ) -> anyhow::Result<()> {
        warn!(agent = %self.name, error = %err, "turn aborted");
        let _ = self.append(EventPayload::local_system(format!("Turn failed: {err}")));
        self.set_state(TurnState::Idle, tx).await;
        let _ = tx.send(AgentEvent::Error(err.to_string())).await;
        Err(err)
    }

    fn append(&self, payload: EventPayload) -> Result<ThreadEvent, StoreError> {
        self.store.append(&self.thread_id, payload)
    }

    /// Forward executor signals (retries, circuit transitions, degradation)
    /// onto the activity stream.
    fn forward_executor_events(&mut self) {
        while let Ok(ev) = self.executor_events.try_recv() {
            match ev {
                ExecutorEvent::Retry {
                    tool,
                    call_id,
                    attempt,
                    delay,
                } => self.activity.emit_kind(
                    ActivityKind::Retry,
                    &self.canonical_id,
                    json!({
                        "tool": tool,
                        "call_id": call_id,
                        "attempt": attempt,
                        "delay_ms": crate::events::duration_ms(delay),
                    }),
                ),
                ExecutorEvent::CircuitOpened { tool, retry_after } => self.activity.emit_kind(
                    ActivityKind::CircuitOpen,
                    &self.canonical_id,
                    json!({
                        "tool": tool,
                        "retry_after_ms": crate::events::duration_ms(retry_after),
                    }),
                ),
                ExecutorEvent::CircuitClosed { tool } => self.activity.emit_kind(
                    ActivityKind::CircuitClose,
                    &self.canonical_id,
                    json!({ "tool": tool }),
                ),
                ExecutorEvent::SequentialFallback { batch_size } => self.activity.emit_kind(
                    ActivityKind::Retry,
                    &self.canonical_id,
                    json!({ "sequential_fallback": true, "batch_size": batch_size }),
                ),
            }
        }
    }

    async fn set_state(&mut self, to: TurnState, tx: &mpsc::Sender<AgentEvent>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        let _ = tx.send(AgentEvent::StateChange { from, to }).await;
        self.activity.emit_kind(
            ActivityKind::StateChange,
            &self.canonical_id,
            json!({ "from": from.as_str(), "to": to.as_str() }),
        );
    }
}
