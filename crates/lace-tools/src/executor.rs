// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use lace_config::ExecutorConfig;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::breaker::{CircuitBreaker, CircuitTransition};
use crate::error::{ErrorCategory, ToolError};
use crate::registry::ToolRegistry;
use crate::retry::RetryPolicy;
use crate::schema;
use crate::tool::{Tool, ToolCall, ToolContext, ToolResult};

/// Signals the executor raises for observers (retries, circuit transitions,
/// degradation).  Forwarded onto the session's activity stream by the
/// runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Retry {
        tool: String,
        call_id: String,
        attempt: u32,
        delay: Duration,
    },
    CircuitOpened {
        tool: String,
        retry_after: Duration,
    },
    CircuitClosed {
        tool: String,
    },
    SequentialFallback {
        batch_size: usize,
    },
}

/// Policy-checked, approval-gated, concurrency-limited tool dispatcher.
///
/// Failures never escape as errors: every call produces a [`ToolResult`],
/// with `is_error` results carrying the failure taxonomy so the agent can
/// append them as events and keep the turn alive.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    semaphore: Arc<Semaphore>,
    tool_timeout: Duration,
    approval: Option<Arc<dyn ApprovalGate>>,
    events: Option<mpsc::UnboundedSender<ExecutorEvent>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, cfg: &ExecutorConfig) -> Self {
        Self {
            registry,
            retry: RetryPolicy::from_config(cfg),
            breaker: CircuitBreaker::from_config(cfg),
            semaphore: Arc::new(Semaphore::new(cfg.max_concurrent_tools.max(1))),
            tool_timeout: Duration::from_secs(cfg.tool_timeout_secs),
            approval: None,
            events: None,
        }
    }

    pub fn with_approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ExecutorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn emit(&self, event: ExecutorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Execute one call: validate → approval gate → circuit check → dispatch
    /// with retry.  Always returns a result for the call's id.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        self.execute_call(call, ctx, false).await
    }

    /// Execute a batch with bounded parallelism.
    ///
    /// Result ordering matches input ordering regardless of completion
    /// order.  When every call in the batch failed with an overload signal,
    /// the batch is retried sequentially (one call at a time) and the
    /// results are marked `sequential_fallback`.
    pub async fn execute_many(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolResult> {
        let futures = calls.iter().map(|c| self.execute_call(c, ctx, false));
        let results = futures::future::join_all(futures).await;

        let all_overloaded = !results.is_empty()
            && results
                .iter()
                .all(|r| r.is_error && r.metadata.category == Some(ErrorCategory::RateLimit));
        if !all_overloaded {
            return results;
        }

        warn!(
            batch_size = calls.len(),
            "entire batch overloaded, retrying sequentially"
        );
        self.emit(ExecutorEvent::SequentialFallback {
            batch_size: calls.len(),
        });
        let mut retried = Vec::with_capacity(calls.len());
        for call in calls {
            retried.push(self.execute_call(call, ctx, true).await);
        }
        retried
    }

    async fn execute_call(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        sequential_fallback: bool,
    ) -> ToolResult {
        let finish = |mut result: ToolResult, attempts: u32| {
            result.metadata.retry_attempts = attempts;
            result.metadata.sequential_fallback = sequential_fallback;
            result
        };

        let Some(tool) = self.registry.get(&call.name) else {
            let err = ToolError::InvalidInput(format!("unknown tool: {}", call.name));
            return finish(ToolResult::from_error(&call.id, &err), 0);
        };

        // Validation happens before any dispatch or approval round-trip.
        if let Err(msg) = schema::validate(&tool.input_schema(), &call.input) {
            let err = ToolError::InvalidInput(msg);
            return finish(ToolResult::from_error(&call.id, &err), 0);
        }

        // Session-level tools consult the gate; infrastructure tools bypass
        // it by construction.
        if tool.requires_approval() && !self.registry.is_infrastructure(&call.name) {
            if let Some(gate) = &self.approval {
                if gate.request_approval(call, ctx).await == ApprovalDecision::Deny {
                    let err =
                        ToolError::PermissionDenied("rejected by approval policy".to_string());
                    return finish(ToolResult::from_error(&call.id, &err), 0);
                }
            }
        }

        let mut attempt = 0u32;
        loop {
            if ctx.signal.is_cancelled() {
                return finish(ToolResult::from_error(&call.id, &ToolError::Cancelled), attempt);
            }

            // Fast-fail while the circuit is open; no dispatch, no retry.
            if let Err(err) = self.breaker.check(&call.name) {
                return finish(ToolResult::from_error(&call.id, &err), attempt);
            }

            let outcome = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("executor semaphore closed");
                self.dispatch(tool.as_ref(), call, ctx).await
            };

            match outcome {
                Ok(content) => {
                    if let Some(CircuitTransition::Closed { tool }) =
                        self.breaker.record_success(&call.name)
                    {
                        self.emit(ExecutorEvent::CircuitClosed { tool });
                    }
                    return finish(ToolResult::ok(&call.id, content), attempt);
                }
                Err(ToolError::Cancelled) => {
                    return finish(
                        ToolResult::from_error(&call.id, &ToolError::Cancelled),
                        attempt,
                    );
                }
                Err(err) => {
                    if err.is_retryable() && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for(attempt, &err);
                        attempt += 1;
                        debug!(
                            tool = %call.name,
                            call_id = %call.id,
                            attempt,
                            ?delay,
                            error = %err,
                            "retrying tool call"
                        );
                        self.emit(ExecutorEvent::Retry {
                            tool: call.name.clone(),
                            call_id: call.id.clone(),
                            attempt,
                            delay,
                        });
                        tokio::select! {
                            biased;
                            _ = ctx.signal.cancelled() => {
                                return finish(
                                    ToolResult::from_error(&call.id, &ToolError::Cancelled),
                                    attempt,
                                );
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }

                    // Final failure of this call; one breaker strike.
                    if let Some(CircuitTransition::Opened { tool, retry_after }) =
                        self.breaker.record_failure(&call.name)
                    {
                        self.emit(ExecutorEvent::CircuitOpened { tool, retry_after });
                    }
                    return finish(ToolResult::from_error(&call.id, &err), attempt);
                }
            }
        }
    }

    /// One dispatch attempt: cancellation pre-empts, the per-tool timeout
    /// produces the `timeout` taxonomy.
    async fn dispatch(
        &self,
        tool: &dyn Tool,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let fut = tool.execute(call.input.clone(), ctx);
        if self.tool_timeout.is_zero() {
            tokio::select! {
                biased;
                _ = ctx.signal.cancelled() => Err(ToolError::Cancelled),
                result = fut => result,
            }
        } else {
            tokio::select! {
                biased;
                _ = ctx.signal.cancelled() => Err(ToolError::Cancelled),
                result = tokio::time::timeout(self.tool_timeout, fut) => {
                    result.unwrap_or(Err(ToolError::Timeout(self.tool_timeout)))
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
