//! Configuration types for Strata
//!
//! All structures deserialize from a partial document: missing fields fall
//! back to their `Default`. Durations are stored as integer milliseconds or
//! seconds and exposed through `Duration` accessors. Upload and import
//! structures are also embedded into File and Slice entities, so they are
//! `Copy` and serialize with camelCase names like the entities; the
//! snake_case names are accepted as aliases in configuration sources.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Root configuration for Strata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Metadata store backend
    pub store: StoreConfig,
    /// Distributed lock configuration
    pub lock: LockConfig,
    /// Ownership distribution configuration
    pub distribution: DistributionConfig,
    /// Storage levels configuration
    pub storage: StorageConfig,
    /// Background operators configuration
    pub operator: OperatorConfig,
    /// Metadata cleanup configuration
    pub metadata_cleanup: MetadataCleanupConfig,
    /// Metrics exporter configuration
    pub metrics: MetricsConfig,
}

impl Config {
    /// Reject invalid thresholds and intervals.
    ///
    /// Called once at load time, operators assume a valid configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.is_empty() {
            return Err(Error::configuration("node.node_id must not be empty"));
        }
        self.store.validate()?;
        if self.lock.ttl_secs == 0 {
            return Err(Error::configuration("lock.ttl_secs must be positive"));
        }
        if self.lock.grant_timeout_ms == 0 {
            return Err(Error::configuration("lock.grant_timeout_ms must be positive"));
        }
        if self.distribution.ttl_secs == 0 {
            return Err(Error::configuration("distribution.ttl_secs must be positive"));
        }
        if self.storage.local.volume_assignment_count == 0 {
            return Err(Error::configuration(
                "storage.local.volume_assignment_count must be positive",
            ));
        }
        self.storage.staging.upload.validate("storage.staging.upload")?;
        self.storage.target.import.validate("storage.target.import")?;
        self.operator.validate()?;
        self.metadata_cleanup.validate()
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier within the cluster
    pub node_id: String,
    /// Directory of the persistent metadata database, in-memory if unset
    pub data_dir: Option<PathBuf>,
    /// How often expired leases are reaped
    pub lease_reaper_interval_ms: u64,
}

impl NodeConfig {
    #[must_use]
    pub const fn lease_reaper_interval(&self) -> Duration {
        Duration::from_millis(self.lease_reaper_interval_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "strata-node".to_string(),
            data_dir: None,
            lease_reaper_interval_ms: 1000,
        }
    }
}

/// Kind of the metadata store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, optionally persisted under `node.data_dir`; one node only
    #[default]
    Embedded,
    /// Shared etcd cluster, all nodes of the cluster connect to it
    Etcd,
}

/// Metadata store connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// etcd endpoints, e.g. `http://127.0.0.1:2379`
    pub endpoints: Vec<String>,
    pub connect_timeout_ms: u64,
    /// Timeout of one request to the store
    pub request_timeout_ms: u64,
}

impl StoreConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::Etcd && self.endpoints.is_empty() {
            return Err(Error::configuration("store.endpoints must not be empty for the etcd backend"));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::configuration(
                "store: connect_timeout_ms and request_timeout_ms must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Embedded,
            endpoints: Vec::new(),
            connect_timeout_ms: 5000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Distributed lock configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Session lease TTL; a lock of a dead node is released after it
    pub ttl_secs: u64,
    /// Maximum time to wait for a contended lock
    pub grant_timeout_ms: u64,
}

impl LockConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub const fn grant_timeout(&self) -> Duration {
        Duration::from_millis(self.grant_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 15,
            grant_timeout_ms: 5000,
        }
    }
}

/// Ownership distribution configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Membership lease TTL
    pub ttl_secs: u64,
}

impl DistributionConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self { ttl_secs: 15 }
    }
}

/// Compression of stored data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

/// Storage levels configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub local: LocalStorageConfig,
    pub staging: StagingStorageConfig,
    pub target: TargetStorageConfig,
}

/// Local (disk) level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    /// Number of writer volumes assigned to each new file
    pub volume_assignment_count: usize,
    /// Compression of slice files on disk
    pub compression: Compression,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            volume_assignment_count: 1,
            compression: Compression::Gzip,
        }
    }
}

/// Staging level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingStorageConfig {
    /// Lifetime of a file in the staging storage, counted from its opening
    pub file_expiration_secs: u64,
    /// Slice upload conditions
    pub upload: UploadConfig,
}

impl StagingStorageConfig {
    #[must_use]
    pub const fn file_expiration(&self) -> Duration {
        Duration::from_secs(self.file_expiration_secs)
    }
}

impl Default for StagingStorageConfig {
    fn default() -> Self {
        Self {
            file_expiration_secs: 24 * 3600,
            upload: UploadConfig::default(),
        }
    }
}

/// Target level
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetStorageConfig {
    /// File import conditions
    pub import: ImportConfig,
}

/// Slice upload conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadConfig {
    /// No upload before this time passes since the slice was opened
    #[serde(alias = "min_interval_ms")]
    pub min_interval_ms: u64,
    pub trigger: UploadTrigger,
}

impl UploadConfig {
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn validate(&self, path: &str) -> Result<()> {
        let t = &self.trigger;
        if t.count == 0 || t.size_bytes == 0 || t.interval_ms == 0 {
            return Err(Error::configuration(format!(
                "{path}.trigger: count, size_bytes and interval_ms must be positive"
            )));
        }
        if self.min_interval_ms > t.interval_ms {
            return Err(Error::configuration(format!(
                "{path}.min_interval_ms must not exceed trigger.interval_ms"
            )));
        }
        Ok(())
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 5000,
            trigger: UploadTrigger::default(),
        }
    }
}

/// Thresholds that close a slice for upload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadTrigger {
    /// Records count
    pub count: u64,
    /// Compressed size in bytes
    #[serde(alias = "size_bytes")]
    pub size_bytes: u64,
    /// Time since the slice was opened
    #[serde(alias = "interval_ms")]
    pub interval_ms: u64,
}

impl UploadTrigger {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for UploadTrigger {
    fn default() -> Self {
        Self {
            count: 10_000,
            size_bytes: 5 * MIB,
            interval_ms: 60_000,
        }
    }
}

/// File import conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportConfig {
    /// No import before this time passes since the file was opened
    #[serde(alias = "min_interval_ms")]
    pub min_interval_ms: u64,
    pub trigger: ImportTrigger,
}

impl ImportConfig {
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn validate(&self, path: &str) -> Result<()> {
        let t = &self.trigger;
        if t.count == 0 || t.size_bytes == 0 || t.interval_ms == 0 {
            return Err(Error::configuration(format!(
                "{path}.trigger: count, size_bytes and interval_ms must be positive"
            )));
        }
        if t.slices_count == 0 {
            return Err(Error::configuration(format!(
                "{path}.trigger.slices_count must be positive"
            )));
        }
        if t.expiration_ms == 0 {
            return Err(Error::configuration(format!(
                "{path}.trigger.expiration_ms must be positive"
            )));
        }
        Ok(())
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 60_000,
            trigger: ImportTrigger::default(),
        }
    }
}

/// Thresholds that close a file for import
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportTrigger {
    /// Records count
    pub count: u64,
    /// Compressed size in bytes
    #[serde(alias = "size_bytes")]
    pub size_bytes: u64,
    /// Time since the file was opened
    #[serde(alias = "interval_ms")]
    pub interval_ms: u64,
    /// Number of slices in the file
    #[serde(alias = "slices_count")]
    pub slices_count: u64,
    /// Import when the file expires within this time
    #[serde(alias = "expiration_ms")]
    pub expiration_ms: u64,
}

impl ImportTrigger {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }
}

impl Default for ImportTrigger {
    fn default() -> Self {
        Self {
            count: 50_000,
            size_bytes: 50 * MIB,
            interval_ms: 5 * 60_000,
            slices_count: 100,
            expiration_ms: 30 * 60_000,
        }
    }
}

/// Background operators configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Maximum number of entities checked in parallel by one operator
    pub max_concurrency: usize,
    pub slice_rotation: SliceRotationConfig,
    pub slice_upload: SliceUploadConfig,
    pub file_rotation: FileRotationConfig,
    pub file_import: FileImportConfig,
}

impl OperatorConfig {
    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::configuration("operator.max_concurrency must be positive"));
        }
        let intervals = [
            ("slice_rotation", self.slice_rotation.check_interval_ms),
            ("slice_upload", self.slice_upload.check_interval_ms),
            ("file_rotation", self.file_rotation.check_interval_ms),
            ("file_import", self.file_import.check_interval_ms),
        ];
        for (name, interval) in intervals {
            if interval == 0 {
                return Err(Error::configuration(format!(
                    "operator.{name}.check_interval_ms must be positive"
                )));
            }
        }
        Ok(())
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 50,
            slice_rotation: SliceRotationConfig::default(),
            slice_upload: SliceUploadConfig::default(),
            file_rotation: FileRotationConfig::default(),
            file_import: FileImportConfig::default(),
        }
    }
}

/// Slice rotation operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceRotationConfig {
    pub check_interval_ms: u64,
    pub rotation_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl SliceRotationConfig {
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub const fn rotation_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation_timeout_ms)
    }

    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for SliceRotationConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            rotation_timeout_ms: 30_000,
            close_timeout_ms: 60_000,
        }
    }
}

/// Slice upload operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceUploadConfig {
    pub check_interval_ms: u64,
    pub upload_timeout_ms: u64,
}

impl SliceUploadConfig {
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub const fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}

impl Default for SliceUploadConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            upload_timeout_ms: 5 * 60_000,
        }
    }
}

/// File rotation operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRotationConfig {
    pub check_interval_ms: u64,
    pub rotation_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl FileRotationConfig {
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub const fn rotation_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation_timeout_ms)
    }

    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for FileRotationConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            rotation_timeout_ms: 30_000,
            close_timeout_ms: 60_000,
        }
    }
}

/// File import operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileImportConfig {
    pub check_interval_ms: u64,
    pub import_timeout_ms: u64,
}

impl FileImportConfig {
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub const fn import_timeout(&self) -> Duration {
        Duration::from_millis(self.import_timeout_ms)
    }
}

impl Default for FileImportConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            import_timeout_ms: 15 * 60_000,
        }
    }
}

/// Metadata cleanup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataCleanupConfig {
    pub enabled: bool,
    /// Pause between cleanup passes
    pub interval_secs: u64,
    /// Maximum number of sinks processed in parallel
    pub concurrency: usize,
    /// A pass stops after this many errors
    pub error_tolerance: usize,
    /// Age after which a not yet imported file is deleted
    pub active_file_expiration_secs: u64,
    /// Age after which an imported file is deleted
    pub archived_file_expiration_secs: u64,
    /// Newest imported files per sink that are never deleted
    pub archived_file_retention_per_sink: usize,
    /// Age after which an import job record is deleted
    pub job_expiration_secs: u64,
}

impl MetadataCleanupConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn active_file_expiration(&self) -> Duration {
        Duration::from_secs(self.active_file_expiration_secs)
    }

    #[must_use]
    pub const fn archived_file_expiration(&self) -> Duration {
        Duration::from_secs(self.archived_file_expiration_secs)
    }

    #[must_use]
    pub const fn job_expiration(&self) -> Duration {
        Duration::from_secs(self.job_expiration_secs)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.interval_secs == 0 || self.concurrency == 0 {
            return Err(Error::configuration(
                "metadata_cleanup: interval_secs and concurrency must be positive",
            ));
        }
        if self.archived_file_expiration_secs > self.active_file_expiration_secs {
            return Err(Error::configuration(
                "metadata_cleanup.archived_file_expiration_secs must not exceed active_file_expiration_secs",
            ));
        }
        Ok(())
    }
}

impl Default for MetadataCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            concurrency: 50,
            error_tolerance: 10,
            active_file_expiration_secs: 7 * 24 * 3600,
            archived_file_expiration_secs: 6 * 3600,
            archived_file_retention_per_sink: 50,
            job_expiration_secs: 24 * 3600,
        }
    }
}

/// Prometheus exporter
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Listen address of the scrape endpoint, disabled if unset
    pub listen: Option<String>,
}
