use super::file::read_file;
use super::sink::read_sink;
use super::stats::{delete_slice_stats, move_slice_stats};
use crate::atomic::{self, Reader, atomic, encode};
use crate::error::{StorageError, StorageResult};
use crate::model::{FileState, Level, Slice, SliceState, validate_file_and_slice_states};
use crate::schema;
use strata_common::config::StorageConfig;
use strata_common::{FileKey, FileVolumeKey, SliceKey, UtcTime};
use strata_meta_store::{DistMutex, Op, SharedStore, Txn};

fn not_found(key: &SliceKey) -> StorageError {
    StorageError::NotFound {
        kind: "slice",
        key: key.to_string(),
        parent: "file",
    }
}

async fn read_slice(r: &Reader, key: &SliceKey) -> StorageResult<Slice> {
    r.get(&schema::slice_all(key)).await?.ok_or_else(|| not_found(key))
}

/// Write the slice to the `all` and level prefixes, remove the old level copy
pub(super) fn put_slice(txn: &mut Txn, old: Option<&Slice>, slice: &Slice) -> StorageResult<()> {
    let value = encode(slice)?;
    txn.push(Op::put(schema::slice_level(slice.level(), &slice.key), value.clone()));
    txn.push(Op::put(schema::slice_all(&slice.key), value));
    if let Some(old) = old {
        if old.level() != slice.level() {
            txn.push(Op::delete(schema::slice_level(old.level(), &old.key)));
        }
    }
    Ok(())
}

/// Slices of all files
pub struct SliceRepository {
    store: SharedStore,
    config: StorageConfig,
}

impl SliceRepository {
    pub(super) const fn new(store: SharedStore, config: StorageConfig) -> Self {
        Self { store, config }
    }

    pub async fn get(&self, key: &SliceKey) -> StorageResult<Slice> {
        atomic::get(&self.store, &schema::slice_all(key)).await?.ok_or_else(|| not_found(key))
    }

    pub async fn list_all(&self) -> StorageResult<Vec<Slice>> {
        atomic::list(&self.store, schema::SLICE_ALL_PREFIX).await
    }

    pub async fn list_in_file(&self, file: &FileKey) -> StorageResult<Vec<Slice>> {
        atomic::list(&self.store, &schema::slices_all_in_file(file)).await
    }

    pub async fn list_in_file_volume(&self, file_volume: &FileVolumeKey) -> StorageResult<Vec<Slice>> {
        atomic::list(&self.store, &schema::slices_all_in_file_volume(file_volume)).await
    }

    pub async fn list_in_level(&self, level: Level) -> StorageResult<Vec<Slice>> {
        atomic::list(&self.store, &schema::slice_level_prefix(level)).await
    }

    pub async fn list_in_state(&self, state: SliceState) -> StorageResult<Vec<Slice>> {
        let mut slices = self.list_in_level(state.level()).await?;
        slices.retain(|s| s.state == state);
        Ok(slices)
    }

    /// Close the opened slice in the file volume and open a new one.
    ///
    /// Fails with [`StorageError::FileNotWriting`] if the file is already closed.
    pub async fn rotate(
        &self,
        file_volume: &FileVolumeKey,
        now: UtcTime,
        lock: Option<&DistMutex>,
    ) -> StorageResult<Slice> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let file = read_file(&r, &file_volume.file).await?;
                if file.state != FileState::Writing {
                    return Err(StorageError::FileNotWriting {
                        key: file.key.to_string(),
                        state: file.state,
                    });
                }
                if !file.assignment.contains(&file_volume.volume_id) {
                    return Err(StorageError::BadRequest(format!(
                        "volume \"{}\" is not assigned to the file \"{}\"",
                        file_volume.volume_id, file.key
                    )));
                }
                let config = read_sink(&r, &file.key.sink).await?.storage_config(&self.config)?;

                let key = SliceKey::new(file_volume.clone(), now);
                if r.get::<Slice>(&schema::slice_all(&key)).await?.is_some() {
                    return Err(StorageError::AlreadyExists {
                        kind: "slice",
                        key: key.to_string(),
                        parent: "file",
                    });
                }

                let mut txn = Txn::new();
                close_opened_slices(&r, &mut txn, file_volume, now).await?;
                let slice = Slice::new(key, &config);
                put_slice(&mut txn, None, &slice)?;
                Ok((txn, slice))
            })
        })
        .await
    }

    /// Close the opened slice in the file volume without opening a new one
    pub async fn close(
        &self,
        file_volume: &FileVolumeKey,
        now: UtcTime,
        lock: Option<&DistMutex>,
    ) -> StorageResult<usize> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let mut txn = Txn::new();
                let closed = close_opened_slices(&r, &mut txn, file_volume, now).await?;
                Ok((txn, closed))
            })
        })
        .await
    }

    /// Generic transition; `Closing` can only be reached by rotation or close
    pub async fn state_transition(
        &self,
        key: &SliceKey,
        now: UtcTime,
        from: SliceState,
        to: SliceState,
        lock: Option<&DistMutex>,
    ) -> StorageResult<Slice> {
        self.transition_with(key, now, from, to, lock, |_| {}).await
    }

    pub async fn switch_to_uploading(
        &self,
        key: &SliceKey,
        now: UtcTime,
        is_empty: bool,
        lock: Option<&DistMutex>,
    ) -> StorageResult<Slice> {
        self.transition_with(key, now, SliceState::Closing, SliceState::Uploading, lock, move |slice| {
            slice.is_empty = is_empty;
        })
        .await
    }

    pub async fn switch_to_uploaded(
        &self,
        key: &SliceKey,
        now: UtcTime,
        lock: Option<&DistMutex>,
    ) -> StorageResult<Slice> {
        self.transition_with(key, now, SliceState::Uploading, SliceState::Uploaded, lock, |_| {})
            .await
    }

    async fn transition_with(
        &self,
        key: &SliceKey,
        now: UtcTime,
        from: SliceState,
        to: SliceState,
        lock: Option<&DistMutex>,
        update: impl Fn(&mut Slice) + Sync,
    ) -> StorageResult<Slice> {
        if to == SliceState::Closing {
            return Err(StorageError::BadRequest(
                "unexpected slice transition to the state \"closing\", use rotate or close methods".to_string(),
            ));
        }

        let update = &update;
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let file = read_file(&r, key.file_key()).await?;
                let old = read_slice(&r, key).await?;
                if old.state != from {
                    return Err(StorageError::UnexpectedState {
                        kind: "slice",
                        key: key.to_string(),
                        state: old.state.as_str(),
                        expected: from.as_str(),
                    });
                }

                let mut slice = old.clone();
                slice.transition(now, to)?;
                update(&mut slice);
                validate_file_and_slice_states(key, file.state, slice.state)?;

                let mut txn = Txn::new();
                if old.level() != slice.level() {
                    move_slice_stats(&r, &mut txn, key, old.level(), slice.level()).await?;
                }
                put_slice(&mut txn, Some(&old), &slice)?;
                Ok((txn, slice))
            })
        })
        .await
    }

    /// Record a failed operation on the slice
    pub async fn increment_retry(
        &self,
        key: &SliceKey,
        now: UtcTime,
        reason: &str,
        lock: Option<&DistMutex>,
    ) -> StorageResult<Slice> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                let old = read_slice(&r, key).await?;
                let mut slice = old.clone();
                slice.retry.increment_retry(now, reason);
                let mut txn = Txn::new();
                put_slice(&mut txn, Some(&old), &slice)?;
                Ok((txn, slice))
            })
        })
        .await
    }

    /// Delete the slice and its statistics
    pub async fn delete(&self, key: &SliceKey, lock: Option<&DistMutex>) -> StorageResult<()> {
        atomic(&self.store, lock, move |r| {
            Box::pin(async move {
                read_slice(&r, key).await?;
                let mut txn = Txn::new().and_then(Op::delete(schema::slice_all(key)));
                for level in Level::ALL {
                    txn.push(Op::delete(schema::slice_level(level, key)));
                }
                delete_slice_stats(&mut txn, key);
                Ok((txn, ()))
            })
        })
        .await
    }
}

/// Switch `Writing` slices of the file volume to `Closing`
async fn close_opened_slices(
    r: &Reader,
    txn: &mut Txn,
    file_volume: &FileVolumeKey,
    now: UtcTime,
) -> StorageResult<usize> {
    let slices: Vec<Slice> = r.list(&schema::slices_all_in_file_volume(file_volume)).await?;
    let mut closed = 0;
    for slice in slices.into_iter().filter(|s| s.state == SliceState::Writing) {
        let mut closing = slice.clone();
        closing.transition(now, SliceState::Closing)?;
        put_slice(txn, Some(&slice), &closing)?;
        closed += 1;
    }
    Ok(closed)
}
