//! Sink definition, read by the storage layer.
//!
//! A sink may override the default upload and import conditions. The
//! overrides are validated when they are applied.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};
use strata_common::SinkKey;
use strata_common::config::{ImportConfig, StorageConfig, UploadConfig};

const fn default_enabled() -> bool {
    true
}

/// Per sink overrides of the storage configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkStoragePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sink {
    #[serde(flatten)]
    pub key: SinkKey,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<SinkStoragePatch>,
}

impl Sink {
    #[must_use]
    pub const fn new(key: SinkKey) -> Self {
        Self {
            key,
            enabled: true,
            storage: None,
        }
    }

    /// Effective storage configuration of the sink
    pub fn storage_config(&self, base: &StorageConfig) -> StorageResult<StorageConfig> {
        let mut config = base.clone();
        if let Some(patch) = &self.storage {
            if let Some(upload) = patch.upload {
                upload.validate("sink.storage.upload")?;
                config.staging.upload = upload;
            }
            if let Some(import) = patch.import {
                import.validate("sink.storage.import")?;
                config.target.import = import;
            }
        }
        Ok(config)
    }
}
