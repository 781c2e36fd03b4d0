//! Persistence for report generation jobs.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::services::ledger::CreditBucket;

const JOB_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

/// Which credit bucket and section depth a job runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    Free,
    Paid,
}

impl AccessLevel {
    #[must_use]
    pub fn bucket(self) -> CreditBucket {
        match self {
            AccessLevel::Free => CreditBucket::Free,
            AccessLevel::Paid => CreditBucket::Paid,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            AccessLevel::Free => "free",
            AccessLevel::Paid => "paid",
        }
    }
}

/// Lifecycle state of a report job. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Monotonic progress marker, visible to concurrent status polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub step: u32,
    pub total: u32,
    pub label: String,
}

/// Metadata persisted for every report job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportJob {
    pub job_id: String,
    pub user_id: String,
    pub idea_id: String,
    pub slug: String,
    pub access_level: AccessLevel,
    pub state: JobState,
    pub progress: Progress,
    #[serde(default)]
    pub result: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ReportJob {
    #[must_use]
    pub fn new(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        idea_id: impl Into<String>,
        slug: impl Into<String>,
        access_level: AccessLevel,
        total_steps: u32,
    ) -> Self {
        let job_id = job_id.into();
        debug_assert!(!job_id.is_empty());
        debug_assert!(total_steps > 0);
        let now_ms = current_timestamp_ms();
        Self {
            job_id,
            user_id: user_id.into(),
            idea_id: idea_id.into(),
            slug: slug.into(),
            access_level,
            state: JobState::Queued,
            progress: Progress {
                step: 0,
                total: total_steps,
                label: "Queued".to_string(),
            },
            result: None,
            error: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// Errors emitted by the job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("job `{0}` already exists")]
    Duplicate(String),
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("job `{0}` is already terminal")]
    Terminal(String),
}

/// LMDB-backed persistence for report jobs.
#[derive(Debug)]
pub struct JobStore {
    env: Env,
    jobs: Database<Str, Bytes>,
}

impl JobStore {
    pub fn open(paths: &AppPaths) -> Result<Self, JobStoreError> {
        let path = paths.jobs_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(JOB_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let jobs = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("jobs"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("jobs"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, jobs })
    }

    pub fn insert(&self, job: &ReportJob) -> Result<(), JobStoreError> {
        debug_assert!(!job.job_id.is_empty());
        debug_assert!(job.state == JobState::Queued);

        let mut wtxn = self.env.write_txn()?;
        if self.jobs.get(&wtxn, job.job_id.as_str())?.is_some() {
            return Err(JobStoreError::Duplicate(job.job_id.clone()));
        }
        let encoded = encode_to_vec(job, config::standard())?;
        self.jobs
            .put(&mut wtxn, job.job_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<ReportJob>, JobStoreError> {
        debug_assert!(!job_id.is_empty());
        let rtxn = self.env.read_txn()?;
        let value = self.jobs.get(&rtxn, job_id)?;
        if let Some(raw) = value {
            let (job, _) = decode_from_slice::<ReportJob, _>(raw, config::standard())?;
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    /// Mark the job picked up by a worker.
    pub fn set_running(&self, job_id: &str) -> Result<ReportJob, JobStoreError> {
        self.mutate(job_id, |job| {
            job.state = JobState::Running;
        })
    }

    /// Record a progress update. Updates with a lower step than the stored
    /// one are dropped so observed steps stay monotonic; terminal jobs are
    /// left untouched.
    pub fn set_progress(
        &self,
        job_id: &str,
        step: u32,
        label: impl Into<String>,
    ) -> Result<(), JobStoreError> {
        let label = label.into();
        let outcome = self.mutate(job_id, |job| {
            if step >= job.progress.step {
                job.progress.step = step.min(job.progress.total);
                job.progress.label = label;
            }
        });
        match outcome {
            Ok(_) => Ok(()),
            // A job that timed out while its worker was still reporting.
            Err(JobStoreError::Terminal(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Transition to `Succeeded`, storing the result and completing progress.
    pub fn complete(
        &self,
        job_id: &str,
        result: BTreeMap<String, String>,
    ) -> Result<ReportJob, JobStoreError> {
        self.mutate(job_id, |job| {
            job.state = JobState::Succeeded;
            job.progress.step = job.progress.total;
            job.progress.label = "Completed".to_string();
            job.result = Some(result);
        })
    }

    /// Transition to `Failed` with a recorded reason.
    pub fn fail(&self, job_id: &str, error: impl Into<String>) -> Result<ReportJob, JobStoreError> {
        let error = error.into();
        self.mutate(job_id, |job| {
            job.state = JobState::Failed;
            job.error = Some(error);
        })
    }

    fn mutate<F>(&self, job_id: &str, apply: F) -> Result<ReportJob, JobStoreError>
    where
        F: FnOnce(&mut ReportJob),
    {
        debug_assert!(!job_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let existing = self.jobs.get(&wtxn, job_id)?;
        let Some(raw) = existing else {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        };
        let (mut job, _) = decode_from_slice::<ReportJob, _>(raw, config::standard())?;
        if job.state.is_terminal() {
            return Err(JobStoreError::Terminal(job_id.to_string()));
        }
        apply(&mut job);
        job.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs.put(&mut wtxn, job_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> JobStore {
        let paths = AppPaths::new(temp.path()).expect("app paths");
        JobStore::open(&paths).expect("open store")
    }

    fn sample_job(id: &str) -> ReportJob {
        ReportJob::new(id, "u1", "idea1", "my-idea", AccessLevel::Free, 3)
    }

    #[test]
    fn new_job_starts_queued_at_step_zero() {
        let job = sample_job("j1");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.progress.step, 0);
        assert_eq!(job.progress.total, 3);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        let job = sample_job("j1");

        store.insert(&job).expect("initial insert");
        let err = store.insert(&job).expect_err("duplicate insert fails");
        assert!(matches!(err, JobStoreError::Duplicate(id) if id == "j1"));
    }

    #[test]
    fn progress_never_moves_backwards() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        store.insert(&sample_job("j1")).expect("insert");
        store.set_running("j1").expect("running");

        store.set_progress("j1", 2, "later").expect("progress");
        store.set_progress("j1", 1, "stale").expect("stale progress accepted");

        let job = store.get("j1").expect("get").expect("exists");
        assert_eq!(job.progress.step, 2, "stale update dropped");
        assert_eq!(job.progress.label, "later");
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        store.insert(&sample_job("j1")).expect("insert");
        store.set_running("j1").expect("running");
        store.fail("j1", "boom").expect("fail");

        let err = store
            .complete("j1", BTreeMap::new())
            .expect_err("terminal job rejects transitions");
        assert!(matches!(err, JobStoreError::Terminal(_)));

        // Late progress from a worker outliving its timeout is dropped silently.
        store.set_progress("j1", 3, "late").expect("late progress ignored");
        let job = store.get("j1").expect("get").expect("exists");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn complete_fills_progress_and_result() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        store.insert(&sample_job("j1")).expect("insert");
        store.set_running("j1").expect("running");

        let mut result = BTreeMap::new();
        result.insert("usp".to_string(), "text".to_string());
        let job = store.complete("j1", result).expect("complete");

        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.progress.step, job.progress.total);
        assert!(job.result.is_some());
        assert!(job.updated_at_ms >= job.created_at_ms);
    }

    #[test]
    fn job_roundtrip_serialization() {
        let job = sample_job("j-rt");
        let encoded = encode_to_vec(&job, config::standard()).expect("encode");
        let (decoded, _) =
            decode_from_slice::<ReportJob, _>(&encoded, config::standard()).expect("decode");
        assert_eq!(decoded.job_id, job.job_id);
        assert_eq!(decoded.access_level, AccessLevel::Free);
        assert_eq!(decoded.state, JobState::Queued);
        assert_eq!(decoded.progress, job.progress);
    }
}
