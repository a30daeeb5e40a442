//! # Retry Policy
//!
//! Backoff computation and outcome classification for delivery attempts. Retries are
//! never timed in-process: the worker turns a [`RetryDecision::Retry`] into a
//! `nextAttemptAt` on the record plus a delayed queue job.

use crate::models::{BackoffStrategy, RetryPolicy};
use rand::Rng;
use std::time::Duration;

/// Upper bound (exclusive) of the random jitter added to a delay
pub const MAX_JITTER_MS: u64 = 1_000;

/// Classification of a single HTTP attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx response
    Delivered,
    /// Network error, timeout or a status listed in `retryOnStatus`
    Retryable,
    /// Any other non-2xx status
    Rejected,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Retryable => "retryable",
            Self::Rejected => "rejected",
        }
    }
}

/// What to do after a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
}

/// Classify an HTTP status under `policy`
pub fn classify_status(status: u16, policy: &RetryPolicy) -> AttemptOutcome {
    if (200..300).contains(&status) {
        AttemptOutcome::Delivered
    } else if policy.retries_status(status) {
        AttemptOutcome::Retryable
    } else {
        AttemptOutcome::Rejected
    }
}

/// Deterministic part of the delay before attempt `attempt + 1`.
///
/// `attempt` is the number of attempts already made (1-based). Linear grows as
/// `initialDelay * attempt`, exponential as `initialDelay * 2^(attempt-1)`, both clamped
/// to `maxDelay`.
pub fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let initial = policy.initial_delay_ms;

    let millis = match policy.backoff_strategy {
        BackoffStrategy::Linear => initial.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            let exponent = attempt - 1;
            if exponent >= 63 {
                u64::MAX
            } else {
                initial.saturating_mul(1u64 << exponent)
            }
        }
    };

    Duration::from_millis(millis.min(policy.max_delay_ms))
}

/// Delay before the next attempt, with jitter in `[0, 1000ms)` when the policy enables it
pub fn calculate_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = base_delay(policy, attempt);
    if policy.jitter {
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MS))
    } else {
        delay
    }
}

/// Decide between another attempt and dead-lettering once `attempt_count` attempts ran
pub fn decide(policy: &RetryPolicy, attempt_count: u32, max_attempts: u32) -> RetryDecision {
    if attempt_count >= max_attempts {
        RetryDecision::DeadLetter
    } else {
        RetryDecision::Retry {
            delay: calculate_delay(policy, attempt_count),
        }
    }
}
