use serde::{Deserialize, Serialize};
use std::fmt;
use strata_common::{FileKey, KeyError, SinkKey, UtcTime};

/// Identifier of an import job in the target storage
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    #[serde(flatten)]
    pub sink: SinkKey,
    pub job_id: String,
}

impl JobKey {
    pub fn new(sink: SinkKey, job_id: impl Into<String>) -> Result<Self, KeyError> {
        let job_id = job_id.into();
        if job_id.is_empty() {
            return Err(KeyError::Required { field: "jobId" });
        }
        if job_id.contains('/') {
            return Err(KeyError::InvalidCharacter {
                field: "jobId",
                value: job_id,
            });
        }
        Ok(Self { sink, job_id })
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sink, self.job_id)
    }
}

/// Import job started for a file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(flatten)]
    pub key: JobKey,
    pub file_opened_at: UtcTime,
    pub created_at: UtcTime,
}

impl Job {
    #[must_use]
    pub fn new(key: JobKey, file: &FileKey, created_at: UtcTime) -> Self {
        Self {
            key,
            file_opened_at: file.opened_at,
            created_at,
        }
    }
}
