//! Contracts of the staging and target storage providers.
//!
//! The operators only drive the lifecycle; moving the data is delegated to
//! a [`SliceUploader`] and a [`FileImporter`].

use async_trait::async_trait;
use strata_common::SinkKey;
use strata_storage::{File, Slice, Statistics};
use tracing::info;

/// Failure reported by a provider, stored as the retry reason
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Uploads a closed slice from the local to the staging storage
#[async_trait]
pub trait SliceUploader: Send + Sync {
    async fn upload_slice(&self, slice: &Slice, stats: &Statistics) -> Result<(), ProviderError>;
}

/// Imports a closed file from the staging to the target storage
#[async_trait]
pub trait FileImporter: Send + Sync {
    /// False if the sink is throttled and no new file should be closed now
    fn can_accept_new_file(&self, _sink: &SinkKey) -> bool {
        true
    }

    /// Import the file; the returned id identifies an asynchronous import job
    async fn import_file(&self, file: &File, stats: &Statistics) -> Result<Option<String>, ProviderError>;
}

/// Provider which only logs the operations, for single node setups and tests
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingProvider;

#[async_trait]
impl SliceUploader for LoggingProvider {
    async fn upload_slice(&self, slice: &Slice, stats: &Statistics) -> Result<(), ProviderError> {
        info!(
            "Uploaded slice \"{}\" as \"{}\", {} records",
            slice.key, slice.staging_storage.object_name, stats.records_count
        );
        Ok(())
    }
}

#[async_trait]
impl FileImporter for LoggingProvider {
    async fn import_file(&self, file: &File, stats: &Statistics) -> Result<Option<String>, ProviderError> {
        info!(
            "Imported file \"{}\", {} records in {} slices",
            file.key, stats.records_count, stats.slices_count
        );
        Ok(None)
    }
}
