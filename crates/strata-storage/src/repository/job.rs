use crate::atomic::{self, atomic, encode};
use crate::error::{StorageError, StorageResult};
use crate::model::{Job, JobKey};
use crate::schema;
use strata_common::SinkKey;
use strata_meta_store::{Op, SharedStore, Txn};

fn not_found(key: &JobKey) -> StorageError {
    StorageError::NotFound {
        kind: "job",
        key: key.to_string(),
        parent: "sink",
    }
}

/// Import jobs
pub struct JobRepository {
    store: SharedStore,
}

impl JobRepository {
    pub(super) const fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn create(&self, job: &Job) -> StorageResult<()> {
        let key = &schema::job(&job.key);
        atomic(&self.store, None, move |r| {
            Box::pin(async move {
                if r.get::<Job>(key).await?.is_some() {
                    return Err(StorageError::AlreadyExists {
                        kind: "job",
                        key: job.key.to_string(),
                        parent: "sink",
                    });
                }
                Ok((Txn::new().and_then(Op::put(key.clone(), encode(job)?)), ()))
            })
        })
        .await
    }

    pub async fn get(&self, key: &JobKey) -> StorageResult<Job> {
        atomic::get(&self.store, &schema::job(key)).await?.ok_or_else(|| not_found(key))
    }

    pub async fn list_all(&self) -> StorageResult<Vec<Job>> {
        atomic::list(&self.store, schema::JOB_PREFIX).await
    }

    pub async fn list_in(&self, sink: &SinkKey) -> StorageResult<Vec<Job>> {
        atomic::list(&self.store, &schema::jobs_in_sink(sink)).await
    }

    pub async fn delete(&self, key: &JobKey) -> StorageResult<()> {
        let txn = Txn::new().and_then(Op::delete(schema::job(key)));
        if self.store.txn(txn).await?.deleted == 0 {
            return Err(not_found(key));
        }
        Ok(())
    }
}
