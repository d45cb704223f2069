// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lace_config::ExecutorConfig;
use tracing::debug;

use crate::error::ToolError;

/// Per-tool circuit breaker: `closed → open → half-open → closed`.
///
/// A circuit opens after `failure_threshold` consecutive failures, rejects
/// calls (fast-fail, no dispatch) for `open_timeout`, then admits up to
/// `half_open_max_calls` probes.  One successful probe closes the circuit;
/// one failed probe re-opens it.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_max_calls: u32,
    states: Mutex<HashMap<String, CircuitState>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { probes_admitted: u32 },
}

/// State changes worth reporting on the activity stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitTransition {
    Opened { tool: String, retry_after: Duration },
    Closed { tool: String },
}

impl CircuitBreaker {
    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            open_timeout: Duration::from_millis(cfg.open_timeout_ms),
            half_open_max_calls: cfg.half_open_max_calls.max(1),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check before dispatching `tool`.
    ///
    /// `Err` carries the fast-fail error with the remaining open time as the
    /// retry hint.
    pub fn check(&self, tool: &str) -> Result<(), ToolError> {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states
            .entry(tool.to_string())
            .or_insert(CircuitState::Closed {
                consecutive_failures: 0,
            });
        match *state {
            CircuitState::Closed { .. } => Ok(()),
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.open_timeout {
                    // Open period over; admit the first probe.
                    *state = CircuitState::HalfOpen { probes_admitted: 1 };
                    debug!(tool, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(ToolError::CircuitBroken {
                        tool: tool.to_string(),
                        retry_after: self.open_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen { probes_admitted } => {
                if probes_admitted < self.half_open_max_calls {
                    *state = CircuitState::HalfOpen {
                        probes_admitted: probes_admitted + 1,
                    };
                    Ok(())
                } else {
                    Err(ToolError::CircuitBroken {
                        tool: tool.to_string(),
                        retry_after: self.open_timeout,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, tool: &str) -> Option<CircuitTransition> {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states
            .entry(tool.to_string())
            .or_insert(CircuitState::Closed {
                consecutive_failures: 0,
            });
        match *state {
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
                debug!(tool, "circuit closed after successful probe");
                Some(CircuitTransition::Closed {
                    tool: tool.to_string(),
                })
            }
            _ => {
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
                None
            }
        }
    }

    pub fn record_failure(&self, tool: &str) -> Option<CircuitTransition> {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states
            .entry(tool.to_string())
            .or_insert(CircuitState::Closed {
                consecutive_failures: 0,
            });
        match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    *state = CircuitState::Open {
                        since: Instant::now(),
                    };
                    debug!(tool, failures, "circuit opened");
                    Some(CircuitTransition::Opened {
                        tool: tool.to_string(),
                        retry_after: self.open_timeout,
                    })
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                    None
                }
            }
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
                debug!(tool, "probe failed, circuit re-opened");
                Some(CircuitTransition::Opened {
                    tool: tool.to_string(),
                    retry_after: self.open_timeout,
                })
            }
            CircuitState::Open { .. } => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::from_config(&ExecutorConfig {
            failure_threshold: threshold,
            open_timeout_ms: open_ms,
            half_open_max_calls: 1,
            ..Default::default()
        })
    }

    #[test]
    fn closed_circuit_admits_calls() {
        let b = breaker(3, 1000);
        assert!(b.check("t").is_ok());
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = breaker(3, 60_000);
        assert!(b.record_failure("t").is_none());
        assert!(b.record_failure("t").is_none());
        let transition = b.record_failure("t");
        assert!(matches!(transition, Some(CircuitTransition::Opened { .. })));
        assert!(matches!(
            b.check("t"),
            Err(ToolError::CircuitBroken { .. })
        ));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let b = breaker(3, 60_000);
        b.record_failure("t");
        b.record_failure("t");
        b.record_success("t");
        b.record_failure("t");
        b.record_failure("t");
        // Still only 2 consecutive — circuit stays closed.
        assert!(b.check("t").is_ok());
    }

    #[test]
    fn open_circuit_reports_remaining_retry_after() {
        let b = breaker(1, 60_000);
        b.record_failure("t");
        match b.check("t") {
            Err(ToolError::CircuitBroken { retry_after, .. }) => {
                assert!(retry_after <= Duration::from_millis(60_000));
                assert!(retry_after > Duration::from_millis(59_000));
            }
            other => panic!("expected CircuitBroken, got {other:?}"),
        }
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_probe_success() {
        let b = breaker(1, 10);
        b.record_failure("t");
        assert!(b.check("t").is_err());
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.check("t").is_ok(), "probe admitted after open_timeout");
        let transition = b.record_success("t");
        assert_eq!(
            transition,
            Some(CircuitTransition::Closed { tool: "t".into() })
        );
        assert!(b.check("t").is_ok());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let b = breaker(1, 10);
        b.record_failure("t");
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.check("t").is_ok());
        let transition = b.record_failure("t");
        assert!(matches!(transition, Some(CircuitTransition::Opened { .. })));
        assert!(b.check("t").is_err());
    }

    #[test]
    fn half_open_caps_probe_count() {
        let b = breaker(1, 10);
        b.record_failure("t");
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.check("t").is_ok(), "first probe admitted");
        assert!(b.check("t").is_err(), "second probe rejected");
    }

    #[test]
    fn circuits_are_per_tool() {
        let b = breaker(1, 60_000);
        b.record_failure("bad");
        assert!(b.check("bad").is_err());
        assert!(b.check("good").is_ok());
    }
}
