//! Retry policy
//!
//! Given an item and the outcome of its latest attempt, decides what happens
//! next. The policy charges the attempt to the item's current method and
//! updates the round counters in place, so the caller only has to persist the
//! item and act on the returned [`Decision`].
//!
//! Per method an item gets `max_loop_count` rounds of `max_attempts_per_method`
//! attempts. When the last round is spent the item moves to the next configured
//! method, or fails terminally when there is none.

use crate::config::{EngineConfig, RetryConfig};
use crate::engine::Outcome;
use crate::WorkItem;
use rand::Rng;
use std::time::Duration;

/// What to do with an item after an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Mark DONE
    Done,

    /// Back to the queue, visible again after `delay`
    Retry { delay: Duration },

    /// Round budget spent; wait for the next round
    Park,

    /// Every round under this method is spent; continue under `to`
    HandOff { to: String },

    /// Give up on the item
    Terminal { reason: String },
}

/// Attempt accounting and backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    methods: Vec<String>,
    max_loop_count: u32,
    max_attempts_per_method: u32,
    max_invalid_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    backoff_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(engine: &EngineConfig, retry: &RetryConfig) -> Self {
        Self {
            methods: engine.methods.clone(),
            max_loop_count: engine.max_loop_count.max(1),
            max_attempts_per_method: engine.max_attempts_per_method.max(1),
            max_invalid_retries: retry.max_invalid_retries,
            backoff_base: Duration::from_millis(retry.backoff_base_ms),
            backoff_max: Duration::from_millis(retry.backoff_max_ms),
            backoff_jitter: Duration::from_millis(retry.backoff_jitter_ms),
        }
    }

    pub fn max_loop_count(&self) -> u32 {
        self.max_loop_count
    }

    pub fn max_attempts_per_method(&self) -> u32 {
        self.max_attempts_per_method
    }

    /// Attempts one method gets before the item leaves it
    pub fn attempts_per_method(&self) -> u32 {
        self.max_loop_count * self.max_attempts_per_method
    }

    pub fn next_method(&self, current: &str) -> Option<&str> {
        let pos = self.methods.iter().position(|m| m == current)?;
        self.methods.get(pos + 1).map(String::as_str)
    }

    /// Records the outcome of one attempt on `item` and decides what follows
    ///
    /// `error` is the message kept as `last_error` for failures.
    pub fn decide(&self, item: &mut WorkItem, outcome: Outcome, error: Option<&str>) -> Decision {
        let attempts = item.record_attempt();
        item.handoff_pending = false;

        if outcome == Outcome::Success {
            item.consecutive_failures = 0;
            item.last_error = None;
            return Decision::Done;
        }

        item.consecutive_failures += 1;
        item.last_error = Some(match error {
            Some(message) => format!("{}: {}", outcome, message),
            None => outcome.to_string(),
        });

        if outcome == Outcome::DataInvalid {
            item.invalid_count += 1;
            if item.invalid_count > self.max_invalid_retries {
                return Decision::Terminal {
                    reason: format!(
                        "expected content missing after {} attempt(s) under {}: {}",
                        item.invalid_count,
                        item.method,
                        error.unwrap_or("no detail")
                    ),
                };
            }
        }

        let round_limit = (item.loop_count + 1) * self.max_attempts_per_method;
        if attempts >= round_limit {
            item.loop_count += 1;
            item.consecutive_failures = 0;
            return self.exhausted_round(item);
        }

        let delay = match outcome {
            Outcome::Transient | Outcome::DataInvalid => {
                self.backoff_delay(item.consecutive_failures)
            }
            // Session restart or identity rotation already happened
            _ => Duration::ZERO,
        };
        Decision::Retry { delay }
    }

    /// Decision for an item whose current round just ended
    fn exhausted_round(&self, item: &WorkItem) -> Decision {
        if item.loop_count < self.max_loop_count {
            return Decision::Park;
        }

        match self.next_method(&item.method) {
            Some(next) => Decision::HandOff {
                to: next.to_string(),
            },
            None => Decision::Terminal {
                reason: format!(
                    "retry budget exhausted ({} attempts under {}): {}",
                    item.attempts(),
                    item.method,
                    item.last_error.as_deref().unwrap_or("unknown error")
                ),
            },
        }
    }

    /// Normalizes an item loaded from an older run or a different config
    ///
    /// Returns a decision for items that already exhausted their method, and
    /// `None` for items that can be offered as they are.
    pub fn normalize(&self, item: &mut WorkItem) -> Option<Decision> {
        if !self.methods.iter().any(|m| m == &item.method) {
            let first = self.methods.first()?;
            tracing::warn!(
                "Item {} is owned by unknown method '{}', moving it to '{}'",
                item.key,
                item.method,
                first
            );
            return Some(Decision::HandOff { to: first.clone() });
        }

        // Counters from a larger budget: the item is past what it may still use
        if item.loop_count >= self.max_loop_count || item.attempts() >= self.attempts_per_method() {
            item.loop_count = item.loop_count.max(self.max_loop_count);
            return Some(self.exhausted_round(item));
        }

        // A crash between the last attempt of a round and the park write
        let round_limit = (item.loop_count + 1) * self.max_attempts_per_method;
        if item.attempts() >= round_limit {
            item.loop_count = item.attempts() / self.max_attempts_per_method;
            item.consecutive_failures = 0;
        }
        None
    }

    /// `base * 2^(n-1)` capped at the maximum, plus uniform jitter
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self
            .backoff_base
            .checked_mul(multiplier)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max);

        let jitter_ms = u64::try_from(self.backoff_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
