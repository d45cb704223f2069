// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lace_config::ExecutorConfig;

use crate::error::ToolError;

/// Exponential backoff policy: `delay = base · multiplier^attempt`, plus up
/// to 10% proportional jitter, capped at `max_delay`.  A `retry_after` hint
/// from the failing call takes precedence (still capped).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base: Duration::from_millis(cfg.retry_base_ms),
            multiplier: cfg.retry_multiplier,
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
        }
    }

    /// Disable retries (single attempt).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// The delay before retry number `attempt` (0-based) of a call that
    /// failed with `error`.
    pub fn delay_for(&self, attempt: u32, error: &ToolError) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint.min(self.max_delay);
        }
        let base = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let base = base.min(self.max_delay.as_secs_f64());
        let jitter = base * 0.1 * simple_random();
        Duration::from_secs_f64(base + jitter)
    }
}

/// Simple pseudo-random number in `[0.0, 1.0)` for jitter.
///
/// Mixes the clock with a process-wide counter; good enough to decorrelate
/// concurrent retries without pulling in an RNG dependency.
fn simple_random() -> f64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mixed = now.wrapping_mul(0x517cc1b727220a95).wrapping_add(count);
    let mixed = mixed ^ (mixed >> 33);
    let mixed = mixed.wrapping_mul(0xc4ceb9fe1a85ec53);
    let mixed = mixed ^ (mixed >> 33);

    (mixed as f64) / (u64::MAX as f64)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }

    fn network() -> ToolError {
        ToolError::Network("down".into())
    }

    #[test]
    fn delay_grows_exponentially() {
        let p = policy();
        let d0 = p.delay_for(0, &network());
        let d2 = p.delay_for(2, &network());
        // attempt 0 ≈ 100ms (+ ≤10% jitter), attempt 2 ≈ 400ms
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(110));
        assert!(d2 >= Duration::from_millis(400) && d2 <= Duration::from_millis(440));
    }

    #[test]
    fn delay_caps_at_max() {
        let p = policy();
        let d = p.delay_for(30, &network());
        // 100ms · 2^30 ≫ cap; jitter adds at most 10% of the capped base.
        assert!(d <= Duration::from_secs(11));
    }

    #[test]
    fn retry_after_hint_takes_precedence() {
        let p = policy();
        let err = ToolError::RateLimit {
            message: "429".into(),
            retry_after: Some(Duration::from_millis(1234)),
        };
        assert_eq!(p.delay_for(0, &err), Duration::from_millis(1234));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let p = policy();
        let err = ToolError::RateLimit {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(p.delay_for(0, &err), p.max_delay);
    }

    #[test]
    fn jitter_varies_between_calls() {
        let p = policy();
        let samples: Vec<Duration> = (0..16).map(|_| p.delay_for(0, &network())).collect();
        let all_equal = samples.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal, "jitter should decorrelate identical retries");
    }

    #[test]
    fn no_retry_policy_has_zero_budget() {
        assert_eq!(RetryPolicy::no_retry().max_retries, 0);
    }
}
