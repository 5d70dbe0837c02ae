//! Upload and import conditions.
//!
//! Both evaluators are pure functions of the trigger configuration, the
//! current time and the statistics. The first matching rule wins:
//!
//! 1. minimum interval since opening not passed
//! 2. sink throttled (import only)
//! 3. expiration close enough (import only)
//! 4. slices count (import only)
//! 5. no record
//! 6. records count
//! 7. compressed size
//! 8. time since opening
//!
//! The returned [`Decision`] carries a cause which is logged as is.

use std::fmt;
use strata_common::UtcTime;
use strata_common::config::{ImportConfig, UploadConfig};
use strata_common::format::{format_bytes, format_duration};
use strata_storage::Statistics;

/// Outcome class of an evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionKind {
    /// A threshold is met, the entity should be rotated
    Met,
    /// No threshold is met
    NotMet,
    /// There is nothing to rotate
    NoRecord,
    /// The destination does not accept new files now
    Throttled,
    /// Too early after the previous rotation
    MinInterval,
}

/// Result of a condition evaluation with a human readable cause
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub kind: DecisionKind,
    pub cause: String,
}

impl Decision {
    fn new(kind: DecisionKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    #[must_use]
    pub fn is_met(&self) -> bool {
        self.kind == DecisionKind::Met
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cause)
    }
}

/// Decide whether a `Writing` slice should be closed for upload
#[must_use]
pub fn should_upload(config: &UploadConfig, now: UtcTime, opened_at: UtcTime, stats: &Statistics) -> Decision {
    let passed = now.duration_since(opened_at);
    if passed < config.min_interval() {
        return min_interval(passed, config.min_interval());
    }

    let trigger = &config.trigger;
    records_conditions(
        now,
        opened_at,
        stats,
        trigger.count,
        trigger.size_bytes,
        trigger.interval(),
    )
}

/// Decide whether a `Writing` file should be closed for import
#[must_use]
pub fn should_import(
    config: &ImportConfig,
    now: UtcTime,
    opened_at: UtcTime,
    expiration: UtcTime,
    stats: &Statistics,
    throttled: bool,
) -> Decision {
    let passed = now.duration_since(opened_at);
    if passed < config.min_interval() {
        return min_interval(passed, config.min_interval());
    }

    if throttled {
        return Decision::new(DecisionKind::Throttled, "sink is throttled");
    }

    let trigger = &config.trigger;
    let remains = expiration.duration_since(now);
    if remains <= trigger.expiration() {
        return Decision::new(
            DecisionKind::Met,
            format!(
                "expiration threshold met, expiration: {expiration}, remains: {}, threshold: {}",
                format_duration(remains),
                format_duration(trigger.expiration())
            ),
        );
    }

    if stats.slices_count >= trigger.slices_count {
        return Decision::new(
            DecisionKind::Met,
            format!(
                "slices count threshold met, slices count: {}, threshold: {}",
                stats.slices_count, trigger.slices_count
            ),
        );
    }

    records_conditions(
        now,
        opened_at,
        stats,
        trigger.count,
        trigger.size_bytes,
        trigger.interval(),
    )
}

fn min_interval(passed: std::time::Duration, threshold: std::time::Duration) -> Decision {
    Decision::new(
        DecisionKind::MinInterval,
        format!(
            "min interval not met, passed: {}, threshold: {}",
            format_duration(passed),
            format_duration(threshold)
        ),
    )
}

fn records_conditions(
    now: UtcTime,
    opened_at: UtcTime,
    stats: &Statistics,
    count: u64,
    size: u64,
    interval: std::time::Duration,
) -> Decision {
    if !stats.has_records() {
        return Decision::new(DecisionKind::NoRecord, "no record");
    }

    if stats.records_count >= count {
        return Decision::new(
            DecisionKind::Met,
            format!(
                "count threshold met, records count: {}, threshold: {count}",
                stats.records_count
            ),
        );
    }

    if stats.compressed_size >= size {
        return Decision::new(
            DecisionKind::Met,
            format!(
                "size threshold met, compressed size: {}, threshold: {}",
                format_bytes(stats.compressed_size),
                format_bytes(size)
            ),
        );
    }

    let passed = now.duration_since(opened_at);
    if passed >= interval {
        return Decision::new(
            DecisionKind::Met,
            format!(
                "time threshold met, opened at: {opened_at}, passed: {}, threshold: {}",
                format_duration(passed),
                format_duration(interval)
            ),
        );
    }

    Decision::new(DecisionKind::NotMet, "no condition met")
}
