//! Storage entities
//!
//! Every entity serializes to JSON with its key flattened into the value,
//! so a value read from the store is self describing.

pub mod file;
pub mod job;
pub mod level;
pub mod retry;
pub mod sink;
pub mod slice;
pub mod stats;
pub mod volume;

pub use file::{File, FileLocalStorage, FileStagingStorage, FileState, FileTargetStorage};
pub use job::{Job, JobKey};
pub use level::Level;
pub use retry::{Retryable, retry_delay};
pub use sink::{Sink, SinkStoragePatch};
pub use slice::{Slice, SliceLocalStorage, SliceStagingStorage, SliceState, validate_file_and_slice_states};
pub use stats::{AggregatedStatistics, Statistics};
pub use volume::Volume;
