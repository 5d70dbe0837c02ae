//! Strata Common - shared types and utilities
//!
//! Hierarchical entity keys, configuration, the error type, the clock
//! abstraction and formatting helpers used by every Strata crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod format;
pub mod types;

pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use types::{
    BranchKey, FileKey, FileVolumeKey, KeyError, SinkKey, SliceKey, SourceKey, UtcTime, VolumeId,
};
