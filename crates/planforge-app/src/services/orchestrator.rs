//! Admission control and job orchestration.
//!
//! Submission is synchronous: validate, debit one credit, persist a queued
//! job, spawn the worker, return the job id. Everything after that point is
//! observable only through status polls. A job that fails or times out
//! refunds its credit exactly once, through the single settlement path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backon::ExponentialBuilder;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::constants::DEFAULT_LOCATION;
use crate::index::cache::RetrievalIndexCache;
use crate::services::corpus::{
    collect_links, plan_queries, summarize_sources, CorpusArtifact, CorpusError, LINKS_PER_QUERY,
};
use crate::services::generate::{GenerateClient, GenerateError};
use crate::services::jobs::{AccessLevel, JobState, JobStore, JobStoreError, Progress, ReportJob};
use crate::services::ledger::{CreditBucket, CreditLedger, LedgerError};
use crate::services::link_search::LinkSearchClient;
use crate::services::object_store::{
    corpus_artifact_key, report_artifact_key, ObjectStore, ObjectStoreError,
};
use crate::services::report::{assemble, compute_shared_context, generate_sections, SectionMap};
use crate::services::reports::{ReportRecord, ReportStore, ReportStoreError};
use crate::services::sections::{free_sections, paid_sections};

/// Credits debited per job, regardless of tier.
const JOB_COST: u64 = 1;

const FREE_STEP_LABELS: &[&str] = &[
    "Starting with your dream",
    "Adding the AI magic",
    "Finalising for you",
];

const PAID_STEP_LABELS: &[&str] = &[
    "Analyzing the Idea",
    "Exploring Possibilities",
    "Shaping the Vision",
    "Gathering Insights",
    "Uncovering Opportunities",
    "Crafting the Narrative",
    "Bringing it to Life",
    "Finalizing the Blueprint",
];

/// What kind of report job a user is asking for.
#[derive(Debug, Clone)]
pub enum JobParams {
    Free {
        idea_id: String,
        slug: String,
        idea: String,
        location: String,
    },
    Paid {
        idea_id: String,
        slug: String,
        idea: String,
        location: String,
    },
    /// Regenerate an existing free report at paid depth, in place.
    Upgrade {
        slug: String,
        idea: String,
        location: String,
    },
}

/// Rejections surfaced synchronously at submission time.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("insufficient {bucket} credits: requested {requested}, available {available}")]
    InsufficientFunds {
        bucket: &'static str,
        requested: u64,
        available: u64,
    },
    #[error("no report found for slug `{0}`")]
    UnknownReport(String),
    #[error("report `{0}` is not eligible for upgrade")]
    NotUpgradable(String),
    #[error(transparent)]
    Ledger(LedgerError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Reports(#[from] ReportStoreError),
}

/// Errors answering a status poll.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

/// Snapshot of a job returned to pollers.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub progress: Progress,
    pub result: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
}

/// Everything a worker can trip over while running a job.
#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Reports(#[from] ReportStoreError),
    #[error(transparent)]
    Objects(#[from] ObjectStoreError),
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A submission resolved into everything the worker needs.
#[derive(Debug, Clone)]
struct JobPlan {
    access_level: AccessLevel,
    idea_id: String,
    slug: String,
    idea: String,
    location: String,
    /// Set when the job overwrites an existing report instead of creating one.
    upgrade_of: Option<String>,
}

/// Owns the stores and clients a report job touches.
#[derive(bon::Builder)]
pub struct Orchestrator {
    ledger: Arc<CreditLedger>,
    jobs: Arc<JobStore>,
    reports: Arc<ReportStore>,
    objects: Arc<dyn ObjectStore>,
    generate: Arc<dyn GenerateClient>,
    links: Option<Arc<dyn LinkSearchClient>>,
    index_cache: Option<Arc<RetrievalIndexCache>>,
    backoff: ExponentialBuilder,
    config: GenerationConfig,
}

impl Orchestrator {
    /// Validate, debit, persist a queued job, and spawn its worker.
    ///
    /// Returns the new job id; the caller polls [`Orchestrator::status`]
    /// from there. The debit is committed before this returns, so a
    /// successful submission is never over admitted.
    pub fn submit(self: &Arc<Self>, user_id: &str, params: JobParams) -> Result<String, SubmitError> {
        if user_id.is_empty() {
            return Err(SubmitError::MissingField("user_id"));
        }
        let plan = self.resolve(user_id, params)?;

        let bucket = plan.access_level.bucket();
        self.ledger
            .try_debit(user_id, JOB_COST, bucket)
            .map_err(|err| match err {
                LedgerError::InsufficientFunds {
                    bucket,
                    requested,
                    available,
                    ..
                } => SubmitError::InsufficientFunds {
                    bucket,
                    requested,
                    available,
                },
                other => SubmitError::Ledger(other),
            })?;

        let job_id = Uuid::new_v4().to_string();
        let total_steps = step_labels(plan.access_level).len() as u32;
        let job = ReportJob::new(
            job_id.clone(),
            user_id,
            plan.idea_id.clone(),
            plan.slug.clone(),
            plan.access_level,
            total_steps,
        );
        if let Err(err) = self.jobs.insert(&job) {
            // Admission rolled back: the job never existed, so the debit
            // must not stand.
            if let Err(refund_err) = self.ledger.credit(user_id, JOB_COST, bucket) {
                error!(user_id, error = %refund_err, "refund after failed admission also failed");
            }
            return Err(SubmitError::Jobs(err));
        }

        info!(
            job_id,
            user_id,
            tier = plan.access_level.label(),
            slug = plan.slug,
            "job admitted"
        );
        let orchestrator = Arc::clone(self);
        let user_id = user_id.to_string();
        let worker_job_id = job_id.clone();
        tokio::spawn(async move {
            orchestrator
                .run_to_completion(worker_job_id, user_id, plan)
                .await;
        });
        Ok(job_id)
    }

    /// Current snapshot of one job.
    pub fn status(&self, job_id: &str) -> Result<JobStatus, StatusError> {
        let job = self
            .jobs
            .get(job_id)?
            .ok_or_else(|| StatusError::UnknownJob(job_id.to_string()))?;
        Ok(JobStatus {
            job_id: job.job_id,
            state: job.state,
            progress: job.progress,
            result: job.result,
            error: job.error,
        })
    }

    fn resolve(&self, user_id: &str, params: JobParams) -> Result<JobPlan, SubmitError> {
        match params {
            JobParams::Free {
                idea_id,
                slug,
                idea,
                location,
            } => {
                require("idea_id", &idea_id)?;
                require("slug", &slug)?;
                require("idea", &idea)?;
                Ok(JobPlan {
                    access_level: AccessLevel::Free,
                    idea_id,
                    slug,
                    idea,
                    location: location_or_default(location),
                    upgrade_of: None,
                })
            }
            JobParams::Paid {
                idea_id,
                slug,
                idea,
                location,
            } => {
                require("idea_id", &idea_id)?;
                require("slug", &slug)?;
                require("idea", &idea)?;
                Ok(JobPlan {
                    access_level: AccessLevel::Paid,
                    idea_id,
                    slug,
                    idea,
                    location: location_or_default(location),
                    upgrade_of: None,
                })
            }
            JobParams::Upgrade {
                slug,
                idea,
                location,
            } => {
                require("slug", &slug)?;
                require("idea", &idea)?;
                let report = self
                    .reports
                    .find_by_user_and_slug(user_id, &slug)?
                    .ok_or_else(|| SubmitError::UnknownReport(slug.clone()))?;
                if report.access_level != AccessLevel::Free {
                    return Err(SubmitError::NotUpgradable(report.report_id));
                }
                Ok(JobPlan {
                    access_level: AccessLevel::Paid,
                    idea_id: report.idea_id,
                    slug,
                    idea,
                    location: location_or_default(location),
                    upgrade_of: Some(report.report_id),
                })
            }
        }
    }

    async fn run_to_completion(self: Arc<Self>, job_id: String, user_id: String, plan: JobPlan) {
        let budget = Duration::from_secs(self.config.job_timeout_secs);
        let bucket = plan.access_level.bucket();
        let outcome = tokio::time::timeout(budget, self.run(&job_id, &user_id, &plan)).await;
        match outcome {
            Ok(Ok(result)) => {
                if let Err(err) = self.jobs.complete(&job_id, result) {
                    error!(job_id, error = %err, "completing a finished job failed");
                } else {
                    info!(job_id, user_id, "job succeeded");
                }
            }
            Ok(Err(err)) => {
                self.settle_failure(&job_id, &user_id, bucket, err.to_string());
            }
            Err(_elapsed) => {
                self.settle_failure(
                    &job_id,
                    &user_id,
                    bucket,
                    format!("job exceeded its {}s budget", budget.as_secs()),
                );
            }
        }
    }

    /// The only place a running job's credit is refunded. Refund first, then
    /// mark the job failed; a worker outliving its timeout hits the terminal
    /// guard in the job store and settles nothing twice.
    fn settle_failure(
        &self,
        job_id: &str,
        user_id: &str,
        bucket: CreditBucket,
        reason: String,
    ) {
        warn!(job_id, user_id, reason, "job failed, refunding its credit");
        if let Err(err) = self.ledger.credit(user_id, JOB_COST, bucket) {
            error!(job_id, user_id, error = %err, "refund failed, balance is short one credit");
        }
        match self.jobs.fail(job_id, reason) {
            Ok(_) => {}
            Err(JobStoreError::Terminal(_)) => {
                // Already settled by the timeout arm.
            }
            Err(err) => error!(job_id, error = %err, "recording job failure failed"),
        }
    }

    async fn run(
        &self,
        job_id: &str,
        user_id: &str,
        plan: &JobPlan,
    ) -> Result<BTreeMap<String, String>, RunError> {
        self.jobs.set_running(job_id)?;
        match plan.access_level {
            AccessLevel::Free => self.run_free(job_id, user_id, plan).await,
            AccessLevel::Paid => self.run_paid(job_id, user_id, plan).await,
        }
    }

    async fn run_free(
        &self,
        job_id: &str,
        user_id: &str,
        plan: &JobPlan,
    ) -> Result<BTreeMap<String, String>, RunError> {
        self.step(job_id, plan.access_level, 1)?;
        let shared = compute_shared_context(
            self.generate.as_ref(),
            &plan.idea,
            &plan.location,
            &self.backoff,
            self.config.max_attempts,
        )
        .await?;

        self.step(job_id, plan.access_level, 2)?;
        let sections = generate_sections(
            Arc::clone(&self.generate),
            &free_sections(),
            &plan.idea,
            &plan.location,
            &shared,
            self.config.section_workers,
            &self.backoff,
            self.config.max_attempts,
        )
        .await;
        let content = assemble(&shared, sections);

        self.step(job_id, plan.access_level, 3)?;
        self.persist_report(user_id, plan, content.clone()).await?;
        Ok(content)
    }

    async fn run_paid(
        &self,
        job_id: &str,
        user_id: &str,
        plan: &JobPlan,
    ) -> Result<BTreeMap<String, String>, RunError> {
        self.step(job_id, plan.access_level, 1)?;
        let shared = compute_shared_context(
            self.generate.as_ref(),
            &plan.idea,
            &plan.location,
            &self.backoff,
            self.config.max_attempts,
        )
        .await?;

        self.step(job_id, plan.access_level, 2)?;
        let corpus = self.gather_corpus(job_id, plan).await?;

        self.step(job_id, plan.access_level, 5)?;
        if !corpus.summary.is_empty() {
            self.publish_corpus(user_id, plan, &corpus).await?;
        }

        self.step(job_id, plan.access_level, 6)?;
        let sections = generate_sections(
            Arc::clone(&self.generate),
            &paid_sections(),
            &plan.idea,
            &plan.location,
            &shared,
            self.config.section_workers,
            &self.backoff,
            self.config.max_attempts,
        )
        .await;

        self.step(job_id, plan.access_level, 7)?;
        let content = assemble(&shared, sections);

        self.step(job_id, plan.access_level, 8)?;
        self.persist_report(user_id, plan, content.clone()).await?;
        Ok(content)
    }

    /// Research phase of a paid job. Absent search integration degrades to
    /// an empty corpus instead of blocking the report.
    async fn gather_corpus(&self, job_id: &str, plan: &JobPlan) -> Result<CorpusArtifact, RunError> {
        let Some(links) = &self.links else {
            warn!(job_id, "no link search client configured, skipping research corpus");
            return Ok(CorpusArtifact::default());
        };

        let queries = plan_queries(
            self.generate.as_ref(),
            &plan.idea,
            &plan.location,
            &self.backoff,
            self.config.max_attempts,
        )
        .await?;

        self.step(job_id, plan.access_level, 3)?;
        let pairs = collect_links(links.as_ref(), &queries, LINKS_PER_QUERY).await?;

        self.step(job_id, plan.access_level, 4)?;
        let entries = summarize_sources(
            Arc::clone(&self.generate),
            pairs,
            self.config.section_workers,
            &self.backoff,
            self.config.max_attempts,
        )
        .await;
        Ok(CorpusArtifact { summary: entries })
    }

    /// Upload the corpus artifact and refresh its retrieval index. The index
    /// rebuild is best-effort; the report never waits on it failing.
    async fn publish_corpus(
        &self,
        user_id: &str,
        plan: &JobPlan,
        corpus: &CorpusArtifact,
    ) -> Result<(), RunError> {
        let key = corpus_artifact_key(user_id, &plan.idea_id);
        let bytes = serde_json::to_vec(corpus)?;
        self.objects.upload(&key, &bytes).await?;

        if let Some(cache) = &self.index_cache {
            cache.invalidate(user_id, &key).await;
            if let Err(err) = cache.get_or_build(user_id, &key).await {
                warn!(user_id, key, error = %err, "retrieval index rebuild failed");
            }
        }
        Ok(())
    }

    async fn persist_report(
        &self,
        user_id: &str,
        plan: &JobPlan,
        content: SectionMap,
    ) -> Result<(), RunError> {
        let (report_id, artifact_key) = match &plan.upgrade_of {
            Some(report_id) => {
                let record = self
                    .reports
                    .replace_content(report_id, plan.access_level, content.clone())?;
                (record.report_id, record.artifact_key)
            }
            None => {
                let report_id = Uuid::new_v4().to_string();
                let artifact_key = report_artifact_key(user_id, &report_id);
                let record = ReportRecord::new(
                    report_id.clone(),
                    user_id,
                    plan.idea_id.clone(),
                    plan.slug.clone(),
                    plan.access_level,
                    content.clone(),
                    artifact_key.clone(),
                );
                self.reports.insert(&record)?;
                (report_id, artifact_key)
            }
        };

        let bytes = serde_json::to_vec(&content)?;
        self.objects.upload(&artifact_key, &bytes).await?;

        if let Some(cache) = &self.index_cache {
            cache.invalidate(user_id, &artifact_key).await;
        }
        info!(user_id, report_id, "report persisted");
        Ok(())
    }

    fn step(&self, job_id: &str, level: AccessLevel, step: u32) -> Result<(), RunError> {
        let labels = step_labels(level);
        debug_assert!(step >= 1 && step as usize <= labels.len());
        let label = labels[(step - 1) as usize];
        self.jobs.set_progress(job_id, step, label)?;
        Ok(())
    }
}

fn step_labels(level: AccessLevel) -> &'static [&'static str] {
    match level {
        AccessLevel::Free => FREE_STEP_LABELS,
        AccessLevel::Paid => PAID_STEP_LABELS,
    }
}

fn require(name: &'static str, value: &str) -> Result<(), SubmitError> {
    if value.trim().is_empty() {
        return Err(SubmitError::MissingField(name));
    }
    Ok(())
}

fn location_or_default(location: String) -> String {
    if location.trim().is_empty() {
        DEFAULT_LOCATION.to_string()
    } else {
        location
    }
}
