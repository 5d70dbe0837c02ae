//! Failure tracking embedded in files and slices.
//!
//! A failed operation increments the attempt counter and schedules the next
//! attempt with an exponential backoff: 2m, 8m, 32m, 128m, then every 3h.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_common::UtcTime;

const RETRY_INITIAL_INTERVAL: Duration = Duration::from_secs(2 * 60);
const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(3 * 3600);
const RETRY_MULTIPLIER: u32 = 4;

/// Delay before the given attempt (1-based) may be retried
#[must_use]
pub fn retry_delay(attempt: u32) -> Duration {
    let mut delay = RETRY_INITIAL_INTERVAL;
    for _ in 1..attempt {
        delay = delay.saturating_mul(RETRY_MULTIPLIER);
        if delay >= RETRY_MAX_INTERVAL {
            return RETRY_MAX_INTERVAL;
        }
    }
    delay.min(RETRY_MAX_INTERVAL)
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Retry state; `retry_after` is set iff `retry_attempt > 0`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retryable {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub retry_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<UtcTime>,
}

impl Retryable {
    /// Check if an operation may be attempted now
    #[must_use]
    pub fn allowed(&self, now: UtcTime) -> bool {
        self.retry_after.is_none_or(|after| now >= after)
    }

    /// Record a failure
    pub fn increment_retry(&mut self, now: UtcTime, reason: impl Into<String>) {
        self.retry_attempt += 1;
        self.retry_reason = reason.into();
        self.first_failed_at.get_or_insert(now);
        self.last_failed_at = Some(now);
        self.retry_after = Some(now.add(retry_delay(self.retry_attempt)));
    }

    /// Forget all failures, called on each successful state transition
    pub fn reset_retry(&mut self) {
        *self = Self::default();
    }
}
