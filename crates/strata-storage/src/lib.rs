//! Storage layer of Strata.
//!
//! Entities ([`File`], [`Slice`], statistics, sinks, jobs) live in the
//! metadata store under the key schema of [`schema`]. All mutations go
//! through the [`Repository`] as atomic operations. Operators read the
//! entities from local [`Mirror`]s and the [`StatisticsCache`].

pub mod atomic;
pub mod closesync;
pub mod error;
pub mod mirror;
pub mod model;
pub mod repository;
pub mod schema;
pub mod statistics;

pub use closesync::{CloseSyncCoordinator, CloseSyncSource};
pub use error::{StorageError, StorageResult};
pub use mirror::{Mirror, MirrorChanges};
pub use model::{
    AggregatedStatistics, File, FileState, Job, JobKey, Level, Retryable, Sink, SinkStoragePatch, Slice, SliceState,
    Statistics, Volume,
};
pub use repository::Repository;
pub use statistics::StatisticsCache;
