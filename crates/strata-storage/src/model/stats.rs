//! Slice statistics.
//!
//! Writer nodes store raw statistics per slice and node in the local
//! level. When a slice is uploaded they are folded into one record in the
//! staging level, on import moved to the target level.

use super::level::Level;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use strata_common::UtcTime;

/// Statistics of records written to one or more slices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_record_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_record_at: Option<UtcTime>,
    #[serde(default)]
    pub records_count: u64,
    /// Number of slices the statistics were aggregated from
    #[serde(default)]
    pub slices_count: u64,
    #[serde(default)]
    pub uncompressed_size: u64,
    #[serde(default)]
    pub compressed_size: u64,
    /// Size in the staging storage, set when the slice is uploaded
    #[serde(default)]
    pub staging_size: u64,
}

impl Statistics {
    #[must_use]
    pub const fn has_records(&self) -> bool {
        self.records_count > 0
    }
}

fn earliest(a: Option<UtcTime>, b: Option<UtcTime>) -> Option<UtcTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<UtcTime>, b: Option<UtcTime>) -> Option<UtcTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl Add for Statistics {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            first_record_at: earliest(self.first_record_at, other.first_record_at),
            last_record_at: latest(self.last_record_at, other.last_record_at),
            records_count: self.records_count + other.records_count,
            slices_count: self.slices_count + other.slices_count,
            uncompressed_size: self.uncompressed_size + other.uncompressed_size,
            compressed_size: self.compressed_size + other.compressed_size,
            staging_size: self.staging_size + other.staging_size,
        }
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Statistics split by storage level
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregatedStatistics {
    pub local: Statistics,
    pub staging: Statistics,
    pub target: Statistics,
    pub total: Statistics,
}

impl AggregatedStatistics {
    pub fn add(&mut self, level: Level, stats: Statistics) {
        match level {
            Level::Local => self.local += stats,
            Level::Staging => self.staging += stats,
            Level::Target => self.target += stats,
        }
        self.total += stats;
    }

    /// Statistics of data not yet imported
    #[must_use]
    pub fn not_imported(&self) -> Statistics {
        self.local + self.staging
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_add() {
        let t1 = UtcTime::parse("2000-01-01T01:00:00.000Z").unwrap();
        let t2 = UtcTime::parse("2000-01-01T02:00:00.000Z").unwrap();
        let a = Statistics {
            first_record_at: Some(t2),
            last_record_at: Some(t2),
            records_count: 10,
            compressed_size: 100,
            ..Statistics::default()
        };
        let b = Statistics {
            first_record_at: Some(t1),
            last_record_at: Some(t1),
            records_count: 5,
            compressed_size: 50,
            ..Statistics::default()
        };

        let sum = a + b + Statistics::default();
        assert_eq!(sum.first_record_at, Some(t1));
        assert_eq!(sum.last_record_at, Some(t2));
        assert_eq!(sum.records_count, 15);
        assert_eq!(sum.compressed_size, 150);
    }

    #[test]
    fn test_aggregated() {
        let one = Statistics {
            records_count: 1,
            slices_count: 1,
            ..Statistics::default()
        };
        let mut agg = AggregatedStatistics::default();
        agg.add(Level::Local, one);
        agg.add(Level::Staging, one);
        agg.add(Level::Target, one);
        assert_eq!(agg.total.records_count, 3);
        assert_eq!(agg.not_imported().slices_count, 2);
    }
}
