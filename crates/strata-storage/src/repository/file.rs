use super::sink::read_sink;
use super::slice::put_slice;
use super::stats::move_slice_stats;
use crate::atomic::{self, Reader, atomic, encode};
use crate::error::{StorageError, StorageResult};
use crate::model::{File, FileState, Level, Slice, SliceState, Volume, validate_file_and_slice_states};
use crate::schema;
use strata_common::config::StorageConfig;
use strata_common::{FileKey, FileVolumeKey, SinkKey, SliceKey, UtcTime, VolumeId};
use strata_meta_store::{DistMutex, Op, SharedStore, Txn};
use strata_placement::hrw_select_n;

fn not_found(key: &FileKey) -> StorageError {
    StorageError::NotFound {
        kind: "file",
        key: key.to_string(),
        parent: "sink",
    }
}

pub(super) async fn read_file(r: &Reader, key: &FileKey) -> StorageResult<File> {
    r.get(&schema::file_all(key)).await?.ok_or_else(|| not_found(key))
}

/// Write the file to the `all` and level prefixes, remove the old level copy
pub(super) fn put_file(txn: &mut Txn, old: Option<&File>, file: &File) -> StorageResult<()> {
    let value = encode(file)?;
    txn.push(Op::put(schema::file_level(file.level(), &file.key), value.clone()));
    txn.push(Op::put(schema::file_all(&file.key), value));
    if let Some(old) = old {
        if old.level() != file.level() {
            txn.push(Op::delete(schema::file_level(old.level(), &old.key)));
        }
    }
    Ok(())
}

/// Files of all sinks
pub struct FileRepository {
    store: SharedStore,
    config: StorageConfig,
}

impl FileRepository {
    pub(super) const fn new(store: SharedStore, config: StorageConfig) -> Self {
        Self { store, config }
    }

    pub async fn get(&self, key: &FileKey) -> StorageResult<File> {
        atomic::get(&self.store, &schema::file_all(key)).await?.ok_or_else(|| not_found(key))
    }

    pub async fn list_all(&self) -> StorageResult<Vec<File>> {
        atomic::list(&self.store, schema::FILE_ALL_PREFIX).await
    }

    /// Files of the sink, oldest first
    pub async fn list_in(&self, sink: &SinkKey) -> StorageResult<Vec<File>> {
        atomic::list(&self.store, &schema::files_all_in_sink(sink)).await
    }

    pub async fn list_in_level(&self, level: Level) -> StorageResult<Vec<File>> {
        atomic::list(&self.store, &schema::file_level_prefix(level)).await
    }

    pub async fn list_in_state(&self, state: FileState) -> StorageResult<Vec<File>> {
        let mut files = self.list_in_level(state.level()).await?;
        files.retain(|f| f.state == state);
        Ok(files)
    }

    /// Close the opened file of the sink and open a new one.
    ///
    /// The new file gets one `Writing` slice per assigned volume.
    pub async fn rotate(&self, sink_key: &SinkKey, now: UtcTime, lock: Option<&DistMutex>) -> StorageResult<File> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let sink = read_sink(&r, sink_key).await?;
                let config = sink.storage_config(&self.config)?;

                let mut txn = Txn::new();
                close_opened_files(&r, &mut txn, sink_key, now).await?;

                let key = FileKey::new(sink_key.clone(), now);
                if r.get::<File>(&schema::file_all(&key)).await?.is_some() {
                    return Err(StorageError::AlreadyExists {
                        kind: "file",
                        key: key.to_string(),
                        parent: "sink",
                    });
                }

                // Assign volumes
                let volumes: Vec<Volume> = r.list(schema::VOLUME_WRITER_PREFIX).await?;
                let ids: Vec<&str> = volumes.iter().map(|v| v.volume_id.as_str()).collect();
                let assignment: Vec<VolumeId> =
                    hrw_select_n(&key.to_string(), &ids, config.local.volume_assignment_count)
                        .into_iter()
                        .map(|id| VolumeId::new_unchecked(*id))
                        .collect();
                if assignment.is_empty() {
                    return Err(StorageError::NoVolume);
                }

                let file = File::new(key, &config, assignment);
                put_file(&mut txn, None, &file)?;
                for volume_id in &file.assignment {
                    let file_volume = FileVolumeKey {
                        file: file.key.clone(),
                        volume_id: volume_id.clone(),
                    };
                    put_slice(&mut txn, None, &Slice::new(SliceKey::new(file_volume, now), &config))?;
                }

                Ok((txn, file))
            })
        })
        .await
    }

    /// Close the opened file of the sink without opening a new one
    pub async fn close_all_in(
        &self,
        sink_key: &SinkKey,
        now: UtcTime,
        lock: Option<&DistMutex>,
    ) -> StorageResult<usize> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let mut txn = Txn::new();
                let closed = close_opened_files(&r, &mut txn, sink_key, now).await?;
                Ok((txn, closed))
            })
        })
        .await
    }

    /// Generic transition; `Closing` can only be reached by rotation or close
    pub async fn state_transition(
        &self,
        key: &FileKey,
        now: UtcTime,
        from: FileState,
        to: FileState,
        lock: Option<&DistMutex>,
    ) -> StorageResult<File> {
        self.transition_with(key, now, from, to, lock, |_| {}).await
    }

    pub async fn switch_to_importing(
        &self,
        key: &FileKey,
        now: UtcTime,
        is_empty: bool,
        lock: Option<&DistMutex>,
    ) -> StorageResult<File> {
        self.transition_with(key, now, FileState::Closing, FileState::Importing, lock, move |file| {
            file.is_empty = is_empty;
        })
        .await
    }

    pub async fn switch_to_imported(
        &self,
        key: &FileKey,
        now: UtcTime,
        lock: Option<&DistMutex>,
    ) -> StorageResult<File> {
        self.transition_with(key, now, FileState::Importing, FileState::Imported, lock, |_| {})
            .await
    }

    async fn transition_with(
        &self,
        key: &FileKey,
        now: UtcTime,
        from: FileState,
        to: FileState,
        lock: Option<&DistMutex>,
        update: impl Fn(&mut File) + Sync,
    ) -> StorageResult<File> {
        if to == FileState::Closing {
            return Err(StorageError::BadRequest(
                "unexpected file transition to the state \"closing\", use rotate or close methods".to_string(),
            ));
        }

        let update = &update;
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let old = read_file(&r, key).await?;
                if old.state != from {
                    return Err(StorageError::UnexpectedState {
                        kind: "file",
                        key: key.to_string(),
                        state: old.state.as_str(),
                        expected: from.as_str(),
                    });
                }

                let mut file = old.clone();
                file.transition(now, to)?;
                update(&mut file);

                let mut txn = Txn::new();
                put_file(&mut txn, Some(&old), &file)?;

                for slice in r.list::<Slice>(&schema::slices_all_in_file(key)).await? {
                    if to == FileState::Imported && slice.state == SliceState::Uploaded {
                        let mut imported = slice.clone();
                        imported.transition(now, SliceState::Imported)?;
                        move_slice_stats(&r, &mut txn, &slice.key, Level::Staging, Level::Target).await?;
                        put_slice(&mut txn, Some(&slice), &imported)?;
                        validate_file_and_slice_states(&imported.key, file.state, imported.state)?;
                    } else {
                        validate_file_and_slice_states(&slice.key, file.state, slice.state)?;
                    }
                }

                Ok((txn, file))
            })
        })
        .await
    }

    /// Record a failed operation on the file
    pub async fn increment_retry(
        &self,
        key: &FileKey,
        now: UtcTime,
        reason: &str,
        lock: Option<&DistMutex>,
    ) -> StorageResult<File> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let old = read_file(&r, key).await?;
                let mut file = old.clone();
                file.retry.increment_retry(now, reason);
                let mut txn = Txn::new();
                put_file(&mut txn, Some(&old), &file)?;
                Ok((txn, file))
            })
        })
        .await
    }

    /// Delete the file with all its slices and statistics
    pub async fn delete(&self, key: &FileKey, lock: Option<&DistMutex>) -> StorageResult<()> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                read_file(&r, key).await?;
                let mut txn = Txn::new().and_then(Op::delete(schema::file_all(key)));
                txn.push(Op::delete_prefix(schema::slices_all_in_file(key)));
                for level in Level::ALL {
                    txn.push(Op::delete(schema::file_level(level, key)));
                    txn.push(Op::delete_prefix(schema::slices_level_in_file(level, key)));
                    txn.push(Op::delete_prefix(schema::stats_in_file(level, key)));
                }
                Ok((txn, ()))
            })
        })
        .await
    }
}

/// Switch `Writing` files of the sink and their `Writing` slices to `Closing`
async fn close_opened_files(r: &Reader, txn: &mut Txn, sink_key: &SinkKey, now: UtcTime) -> StorageResult<usize> {
    let files: Vec<File> = r.list(&schema::files_level_in_sink(Level::Local, sink_key)).await?;
    let mut closed = 0;
    for file in files.into_iter().filter(|f| f.state == FileState::Writing) {
        let mut closing = file.clone();
        closing.transition(now, FileState::Closing)?;
        put_file(txn, Some(&file), &closing)?;

        let slices: Vec<Slice> = r.list(&schema::slices_level_in_file(Level::Local, &file.key)).await?;
        for slice in slices.into_iter().filter(|s| s.state == SliceState::Writing) {
            let mut closing = slice.clone();
            closing.transition(now, SliceState::Closing)?;
            put_slice(txn, Some(&slice), &closing)?;
        }
        closed += 1;
    }
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use crate::model::{FileState, Level, Sink, SinkStoragePatch, SliceState, Statistics};
    use crate::repository::test_util::{repository, repository_with, sink_key, utc};
    use crate::schema;
    use strata_common::SinkKey;
    use strata_common::config::{Compression, ImportConfig, ImportTrigger, StorageConfig};

    #[tokio::test]
    async fn test_rotate_creates_file_and_slices() {
        let repo = repository(&["vol-1", "vol-2", "vol-3"]).await;
        let now = utc("2000-01-01T01:00:00.000Z");

        let file = repo.file().rotate(&sink_key(), now, None).await.unwrap();
        assert_eq!(file.state, FileState::Writing);
        assert_eq!(file.assignment.len(), 1);
        assert_eq!(file.staging_storage.expiration.to_string(), "2000-01-02T01:00:00.000Z");

        let slices = repo.slice().list_in_file(&file.key).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].state, SliceState::Writing);
        assert_eq!(slices[0].key.file_volume.volume_id, file.assignment[0]);

        // Stored under all and level keys
        let level_key = schema::file_level(Level::Local, &file.key);
        assert!(repo.store().get(&level_key).await.unwrap().is_some());
        assert_eq!(repo.file().get(&file.key).await.unwrap(), file);
    }

    #[tokio::test]
    async fn test_rotate_closes_previous_file() {
        let repo = repository(&["vol-1"]).await;
        let t1 = utc("2000-01-01T01:00:00.000Z");
        let t2 = utc("2000-01-01T02:00:00.000Z");

        let first = repo.file().rotate(&sink_key(), t1, None).await.unwrap();
        let second = repo.file().rotate(&sink_key(), t2, None).await.unwrap();

        let first = repo.file().get(&first.key).await.unwrap();
        assert_eq!(first.state, FileState::Closing);
        assert_eq!(first.closing_at, Some(t2));
        assert_eq!(repo.file().list_in_state(FileState::Writing).await.unwrap(), vec![second]);

        let slices = repo.slice().list_in_file(&first.key).await.unwrap();
        assert_eq!(slices[0].state, SliceState::Closing);
    }

    #[tokio::test]
    async fn test_rotate_errors() {
        let repo = repository(&[]).await;
        let now = utc("2000-01-01T01:00:00.000Z");
        let err = repo.file().rotate(&sink_key(), now, None).await.unwrap_err();
        assert_eq!(err.to_string(), "no volume is available for the file");

        let unknown = SinkKey::new(1, 2, "source", "unknown");
        let err = repo.file().rotate(&unknown, now, None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let repo = repository(&["vol-1"]).await;
        let t1 = utc("2000-01-01T01:00:00.000Z");
        let t2 = utc("2000-01-01T02:00:00.000Z");
        let file = repo.file().rotate(&sink_key(), t1, None).await.unwrap();

        let err = repo
            .file()
            .state_transition(&file.key, t2, FileState::Writing, FileState::Closing, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected file transition to the state \"closing\", use rotate or close methods"
        );

        let err = repo.file().switch_to_importing(&file.key, t2, false, None).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(
            err.to_string(),
            "file \"123/456/my-source/my-sink/2000-01-01T01:00:00.000Z\" is in \"writing\" state, expected \"closing\""
        );

        // The slice is not uploaded yet
        assert_eq!(repo.file().close_all_in(&sink_key(), t2, None).await.unwrap(), 1);
        let err = repo.file().switch_to_importing(&file.key, t2, false, None).await.unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[tokio::test]
    async fn test_full_lifecycle_moves_statistics() {
        let repo = repository(&["vol-1"]).await;
        let t1 = utc("2000-01-01T01:00:00.000Z");
        let t2 = utc("2000-01-01T02:00:00.000Z");
        let file = repo.file().rotate(&sink_key(), t1, None).await.unwrap();
        let slice = repo.slice().list_in_file(&file.key).await.unwrap().remove(0);

        let stats = Statistics {
            records_count: 10,
            compressed_size: 100,
            uncompressed_size: 1000,
            ..Statistics::default()
        };
        repo.stats().put(&slice.key, "node-1", &stats).await.unwrap();
        repo.stats().put(&slice.key, "node-2", &stats).await.unwrap();

        repo.file().close_all_in(&sink_key(), t2, None).await.unwrap();
        repo.slice().switch_to_uploading(&slice.key, t2, false, None).await.unwrap();
        repo.slice().switch_to_uploaded(&slice.key, t2, None).await.unwrap();

        let store = repo.store();
        let staging = store.get(&schema::stats_sum(Level::Staging, &slice.key)).await.unwrap().unwrap();
        let staging: Statistics = serde_json::from_slice(&staging.value).unwrap();
        assert_eq!(staging.records_count, 20);
        assert_eq!(staging.staging_size, 200);
        assert_eq!(store.count(&schema::stats_level_prefix(Level::Local)).await.unwrap(), 0);

        repo.file().switch_to_importing(&file.key, t2, false, None).await.unwrap();
        let imported = repo.file().switch_to_imported(&file.key, t2, None).await.unwrap();
        assert_eq!(imported.state, FileState::Imported);
        assert_eq!(repo.slice().get(&slice.key).await.unwrap().state, SliceState::Imported);
        assert!(store.get(&schema::stats_sum(Level::Target, &slice.key)).await.unwrap().is_some());
        assert_eq!(store.count(&schema::stats_level_prefix(Level::Staging)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_saved_file_loads_equal() {
        let import = ImportConfig {
            min_interval_ms: 1500,
            trigger: ImportTrigger {
                count: 321,
                size_bytes: 2048,
                interval_ms: 120_000,
                slices_count: 4,
                expiration_ms: 600_000,
            },
        };
        let mut config = StorageConfig::default();
        config.local.compression = Compression::None;
        config.staging.file_expiration_secs = 7200;
        let sink = Sink {
            storage: Some(SinkStoragePatch {
                upload: None,
                import: Some(import),
            }),
            ..Sink::new(sink_key())
        };
        let repo = repository_with(config, sink, &["vol-1"]).await;

        let t1 = utc("2000-01-01T01:00:00.000Z");
        let t2 = utc("2000-01-01T01:30:00.000Z");
        let t3 = utc("2000-01-01T01:40:00.000Z");
        let file = repo.file().rotate(&sink_key(), t1, None).await.unwrap();
        repo.file().increment_retry(&file.key, t2, "first error", None).await.unwrap();
        let saved = repo.file().increment_retry(&file.key, t3, "second error", None).await.unwrap();

        assert_eq!(saved.local_storage.compression, Compression::None);
        assert_eq!(saved.local_storage.volumes_count, 1);
        assert_eq!(saved.staging_storage.expiration.to_string(), "2000-01-01T03:00:00.000Z");
        assert_eq!(saved.target_storage.import, import);
        assert_eq!(saved.retry.retry_attempt, 2);
        assert_eq!(saved.retry.retry_reason, "second error");
        assert_eq!(saved.retry.first_failed_at, Some(t2));
        assert_eq!(saved.retry.last_failed_at, Some(t3));
        assert_eq!(saved.retry.retry_after.unwrap().to_string(), "2000-01-01T01:48:00.000Z");

        // Every copy of the file holds the same value
        assert_eq!(repo.file().get(&file.key).await.unwrap(), saved);
        assert_eq!(repo.file().list_in_level(Level::Local).await.unwrap(), vec![saved.clone()]);
        assert_eq!(repo.file().list_in(&sink_key()).await.unwrap(), vec![saved]);
    }

    #[tokio::test]
    async fn test_increment_retry_and_delete() {
        let repo = repository(&["vol-1"]).await;
        let t1 = utc("2000-01-01T01:00:00.000Z");
        let first = repo.file().rotate(&sink_key(), t1, None).await.unwrap();
        let second = repo
            .file()
            .rotate(&sink_key(), utc("2000-01-01T02:00:00.000Z"), None)
            .await
            .unwrap();
        let slice = repo.slice().list_in_file(&first.key).await.unwrap().remove(0);
        repo.stats().put(&slice.key, "node-1", &Statistics::default()).await.unwrap();

        let file = repo.file().increment_retry(&first.key, t1, "some error", None).await.unwrap();
        assert_eq!(file.retry.retry_attempt, 1);
        assert_eq!(file.retry.retry_after.unwrap().to_string(), "2000-01-01T01:02:00.000Z");
        assert_eq!(repo.file().get(&first.key).await.unwrap().retry.retry_reason, "some error");

        repo.file().delete(&first.key, None).await.unwrap();
        assert!(repo.file().get(&first.key).await.unwrap_err().is_not_found());
        assert!(repo.slice().list_in_file(&first.key).await.unwrap().is_empty());
        assert_eq!(repo.store().count(schema::STATS_PREFIX).await.unwrap(), 0);

        // Other files are untouched
        assert_eq!(repo.file().list_all().await.unwrap().len(), 1);
        assert_eq!(repo.slice().list_in_file(&second.key).await.unwrap().len(), 1);

        let err = repo.file().delete(&first.key, None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "file \"123/456/my-source/my-sink/2000-01-01T01:00:00.000Z\" not found in the sink"
        );
    }
}
