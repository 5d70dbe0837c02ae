//! Strata Operator - background lifecycle operators
//!
//! Each operator owns a shard of the entities through a distribution group,
//! mirrors them from the metadata store and periodically moves them along
//! the lifecycle:
//!
//! - [`SliceRotation`]: `Writing` slice → `Closing` → `Uploading`
//! - [`SliceUpload`]: `Uploading` slice → `Uploaded`
//! - [`FileRotation`]: `Writing` file → `Closing` → `Importing`
//! - [`FileImport`]: `Importing` file → `Imported`
//! - [`MetadataCleanup`]: deletes expired files and jobs

pub mod common;
pub mod condition;
pub mod error;
pub mod file_import;
pub mod file_rotation;
pub mod metacleanup;
pub mod metrics;
pub mod provider;
pub mod slice_rotation;
pub mod slice_upload;
pub mod tracked;

#[cfg(test)]
mod test_util;

pub use common::Dependencies;
pub use condition::{Decision, DecisionKind, should_import, should_upload};
pub use error::{OperatorError, OperatorResult};
pub use file_import::FileImport;
pub use file_rotation::FileRotation;
pub use metacleanup::{CleanupReport, MetadataCleanup};
pub use provider::{FileImporter, LoggingProvider, ProviderError, SliceUploader};
pub use slice_rotation::SliceRotation;
pub use slice_upload::SliceUpload;

use std::sync::Arc;
use strata_common::config::{MetadataCleanupConfig, OperatorConfig};
use tracing::info;

/// All operators of one node
pub struct Operators {
    pub slice_rotation: Arc<SliceRotation>,
    pub slice_upload: Arc<SliceUpload>,
    pub file_rotation: Arc<FileRotation>,
    pub file_import: Arc<FileImport>,
    pub metadata_cleanup: Arc<MetadataCleanup>,
    deps: Dependencies,
}

impl Operators {
    /// Start all operators, each one joins its distribution group and syncs its mirrors
    pub async fn start(
        deps: &Dependencies,
        config: &OperatorConfig,
        cleanup: &MetadataCleanupConfig,
    ) -> OperatorResult<Self> {
        let max = config.max_concurrency;
        let operators = Self {
            slice_rotation: SliceRotation::start(deps, config.slice_rotation, max).await?,
            slice_upload: SliceUpload::start(deps, config.slice_upload, max).await?,
            file_rotation: FileRotation::start(deps, config.file_rotation, max).await?,
            file_import: FileImport::start(deps, config.file_import, max).await?,
            metadata_cleanup: MetadataCleanup::start(deps, *cleanup).await?,
            deps: deps.clone(),
        };
        info!("All operators started");
        Ok(operators)
    }

    /// Stop the tickers and wait for running checks.
    ///
    /// Mirrors, groups and locks are left running, so interrupted checks
    /// end as shutdown and not as failures. Stop them afterwards.
    pub async fn shutdown(&self) {
        self.deps.stop_workers().await;
        info!("All operators stopped");
    }
}
