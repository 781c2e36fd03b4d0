//! End-to-end job lifecycle tests over real stores and a scripted
//! generation client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use tempfile::TempDir;

use planforge_app::config::GenerationConfig;
use planforge_app::index::cache::RetrievalIndexCache;
use planforge_app::paths::AppPaths;
use planforge_app::services::corpus::CorpusArtifact;
use planforge_app::services::embed::{EmbedClient, EmbedError, EmbedTask};
use planforge_app::services::generate::{GenerateClient, GenerateError};
use planforge_app::services::jobs::{AccessLevel, JobState, JobStore};
use planforge_app::services::ledger::{CreditBucket, CreditLedger};
use planforge_app::services::link_search::{LinkSearchClient, LinkSearchError, QueryLinks};
use planforge_app::services::object_store::{
    corpus_artifact_key, fingerprint_marker_key, index_blob_key, FsObjectStore, ObjectStore,
};
use planforge_app::services::orchestrator::{JobParams, JobStatus, Orchestrator, StatusError, SubmitError};
use planforge_app::services::reports::ReportStore;

struct StubClient {
    fail_marker: Option<&'static str>,
    delay: Duration,
}

impl StubClient {
    fn healthy() -> Self {
        Self {
            fail_marker: None,
            delay: Duration::ZERO,
        }
    }

    fn failing_on(marker: &'static str) -> Self {
        Self {
            fail_marker: Some(marker),
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            fail_marker: None,
            delay,
        }
    }
}

#[async_trait]
impl GenerateClient for StubClient {
    async fn generate(&self, prompt: &str, _max_tokens: u32) -> Result<String, GenerateError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(marker) = self.fail_marker {
            if prompt.contains(marker) {
                return Err(GenerateError::Transient("scripted failure".to_string()));
            }
        }
        if prompt.contains("ISO 4217") {
            return Ok("EUR".to_string());
        }
        Ok("generated text".to_string())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<CreditLedger>,
    reports: Arc<ReportStore>,
    _temp: TempDir,
}

fn harness(client: StubClient, job_timeout_secs: u64) -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("app paths");
    let ledger = Arc::new(CreditLedger::open(&paths).expect("ledger"));
    let jobs = Arc::new(JobStore::open(&paths).expect("jobs"));
    let reports = Arc::new(ReportStore::open(&paths).expect("reports"));
    let objects: Arc<dyn ObjectStore> =
        Arc::new(FsObjectStore::builder().paths(paths).build());
    let generate: Arc<dyn GenerateClient> = Arc::new(client);

    let orchestrator = Arc::new(
        Orchestrator::builder()
            .ledger(Arc::clone(&ledger))
            .jobs(jobs)
            .reports(Arc::clone(&reports))
            .objects(objects)
            .generate(generate)
            .backoff(ExponentialBuilder::default().with_min_delay(Duration::from_millis(1)))
            .config(GenerationConfig {
                section_workers: 4,
                max_attempts: 1,
                job_timeout_secs,
            })
            .build(),
    );
    Harness {
        orchestrator,
        ledger,
        reports,
        _temp: temp,
    }
}

fn free_params() -> JobParams {
    JobParams::Free {
        idea_id: "idea1".to_string(),
        slug: "vegan-bakery".to_string(),
        idea: "a vegan bakery".to_string(),
        location: "Germany".to_string(),
    }
}

/// Poll until the job is terminal, recording every observed progress step.
async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> (JobStatus, Vec<u32>) {
    let mut observed = Vec::new();
    for _ in 0..500 {
        let status = orchestrator.status(job_id).expect("status");
        observed.push(status.progress.step);
        if status.state.is_terminal() {
            return (status, observed);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread")]
async fn free_job_succeeds_and_spends_the_credit() {
    let h = harness(StubClient::healthy(), 60);
    h.ledger.credit("u1", 1, CreditBucket::Free).expect("credit");

    let job_id = h
        .orchestrator
        .submit("u1", free_params())
        .expect("admitted");
    let (status, observed) = wait_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.progress.total, 3);
    assert_eq!(status.progress.step, 3);
    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "steps monotonic: {observed:?}");

    let result = status.result.expect("result stored");
    // 12 sections plus the shared summary and currency slots.
    assert_eq!(result.len(), 14);
    assert_eq!(result["currency"], "EUR");
    assert_eq!(result["usp"], "generated text");

    let balance = h.ledger.balance("u1").expect("balance");
    assert_eq!(balance.free_credits, 0, "success keeps the debit");

    let record = h
        .reports
        .find_by_user_and_slug("u1", "vegan-bakery")
        .expect("lookup")
        .expect("persisted");
    assert_eq!(record.access_level, AccessLevel::Free);
}

#[tokio::test(flavor = "multi_thread")]
async fn submission_without_credits_is_rejected_synchronously() {
    let h = harness(StubClient::healthy(), 60);

    let err = h
        .orchestrator
        .submit("u1", free_params())
        .expect_err("no credits");
    assert!(matches!(
        err,
        SubmitError::InsufficientFunds {
            requested: 1,
            available: 0,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn blank_fields_are_rejected_before_any_debit() {
    let h = harness(StubClient::healthy(), 60);
    h.ledger.credit("u1", 1, CreditBucket::Free).expect("credit");

    let err = h
        .orchestrator
        .submit(
            "u1",
            JobParams::Free {
                idea_id: "idea1".to_string(),
                slug: "s".to_string(),
                idea: "  ".to_string(),
                location: "Germany".to_string(),
            },
        )
        .expect_err("blank idea");
    assert!(matches!(err, SubmitError::MissingField("idea")));

    let balance = h.ledger.balance("u1").expect("balance");
    assert_eq!(balance.free_credits, 1, "validation precedes the debit");

    // A blank location is not an error; it falls back to the default.
    let job_id = h
        .orchestrator
        .submit(
            "u1",
            JobParams::Free {
                idea_id: "idea1".to_string(),
                slug: "s".to_string(),
                idea: "an idea".to_string(),
                location: String::new(),
            },
        )
        .expect("defaulted location admitted");
    let (status, _) = wait_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(status.state, JobState::Succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_context_failure_refunds_exactly_once() {
    let h = harness(StubClient::failing_on("context summary"), 60);
    h.ledger.credit("u1", 1, CreditBucket::Free).expect("credit");

    let job_id = h
        .orchestrator
        .submit("u1", free_params())
        .expect("admitted");
    let (status, _) = wait_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(status.state, JobState::Failed);
    assert!(status.error.is_some());
    assert!(status.result.is_none());

    let balance = h.ledger.balance("u1").expect("balance");
    assert_eq!(balance.free_credits, 1, "failed job refunds its one credit");
}

#[tokio::test(flavor = "multi_thread")]
async fn one_credit_admits_exactly_one_of_two_concurrent_submissions() {
    let h = harness(StubClient::healthy(), 60);
    h.ledger.credit("u1", 1, CreditBucket::Free).expect("credit");

    let a = {
        let orchestrator = Arc::clone(&h.orchestrator);
        tokio::spawn(async move { orchestrator.submit("u1", free_params()) })
    };
    let b = {
        let orchestrator = Arc::clone(&h.orchestrator);
        tokio::spawn(async move { orchestrator.submit("u1", free_params()) })
    };
    let outcomes = [a.await.expect("join"), b.await.expect("join")];
    let admitted: Vec<&String> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    assert_eq!(admitted.len(), 1, "one credit admits one job");

    let (status, _) = wait_terminal(&h.orchestrator, admitted[0]).await;
    assert_eq!(status.state, JobState::Succeeded);
    let balance = h.ledger.balance("u1").expect("balance");
    assert_eq!(balance.free_credits, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failed_section_degrades_in_band_without_failing_the_job() {
    let h = harness(StubClient::failing_on("SWOT"), 60);
    h.ledger.credit("u1", 1, CreditBucket::Free).expect("credit");

    let job_id = h
        .orchestrator
        .submit("u1", free_params())
        .expect("admitted");
    let (status, _) = wait_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(status.state, JobState::Succeeded);
    let result = status.result.expect("result stored");
    assert!(
        result["swot_analysis"].starts_with("Error generating swot_analysis:"),
        "failed section holds its placeholder"
    );
    assert_eq!(result["usp"], "generated text", "siblings unaffected");

    let balance = h.ledger.balance("u1").expect("balance");
    assert_eq!(balance.free_credits, 0, "degraded success keeps the debit");
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_job_fails_and_refunds() {
    let h = harness(StubClient::slow(Duration::from_millis(200)), 0);
    h.ledger.credit("u1", 1, CreditBucket::Free).expect("credit");

    let job_id = h
        .orchestrator
        .submit("u1", free_params())
        .expect("admitted");
    let (status, _) = wait_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(status.state, JobState::Failed);
    let reason = status.error.expect("reason recorded");
    assert!(reason.contains("budget"), "reason names the timeout, got {reason:?}");

    let balance = h.ledger.balance("u1").expect("balance");
    assert_eq!(balance.free_credits, 1, "timeout refunds the credit");
}

#[tokio::test(flavor = "multi_thread")]
async fn upgrade_rewrites_the_report_in_place() {
    let h = harness(StubClient::healthy(), 60);
    h.ledger.credit("u1", 1, CreditBucket::Free).expect("credit");
    h.ledger.credit("u1", 2, CreditBucket::Paid).expect("credit");

    let free_job = h
        .orchestrator
        .submit("u1", free_params())
        .expect("admitted");
    wait_terminal(&h.orchestrator, &free_job).await;
    let original = h
        .reports
        .find_by_user_and_slug("u1", "vegan-bakery")
        .expect("lookup")
        .expect("free report exists");

    let upgrade = JobParams::Upgrade {
        slug: "vegan-bakery".to_string(),
        idea: "a vegan bakery".to_string(),
        location: "Germany".to_string(),
    };
    let upgrade_job = h
        .orchestrator
        .submit("u1", upgrade.clone())
        .expect("upgrade admitted");
    let (status, _) = wait_terminal(&h.orchestrator, &upgrade_job).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.progress.total, 8, "paid-depth step count");
    let result = status.result.expect("result stored");
    // 22 sections plus the shared summary and currency slots.
    assert_eq!(result.len(), 24);

    let upgraded = h
        .reports
        .find_by_user_and_slug("u1", "vegan-bakery")
        .expect("lookup")
        .expect("still one report");
    assert_eq!(upgraded.report_id, original.report_id, "upgraded in place");
    assert_eq!(upgraded.access_level, AccessLevel::Paid);
    assert_eq!(upgraded.sections.len(), 24);

    // A paid report cannot be upgraded again.
    let err = h
        .orchestrator
        .submit("u1", upgrade)
        .expect_err("already paid");
    assert!(matches!(err, SubmitError::NotUpgradable(_)));
    let balance = h.ledger.balance("u1").expect("balance");
    assert_eq!(balance.paid_credits, 1, "rejected upgrade debits nothing");
}

#[tokio::test(flavor = "multi_thread")]
async fn upgrading_a_missing_slug_is_rejected() {
    let h = harness(StubClient::healthy(), 60);
    h.ledger.credit("u1", 1, CreditBucket::Paid).expect("credit");

    let err = h
        .orchestrator
        .submit(
            "u1",
            JobParams::Upgrade {
                slug: "nothing-here".to_string(),
                idea: "idea".to_string(),
                location: "Germany".to_string(),
            },
        )
        .expect_err("no such report");
    assert!(matches!(err, SubmitError::UnknownReport(slug) if slug == "nothing-here"));
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_an_unknown_job_is_a_typed_error() {
    let h = harness(StubClient::healthy(), 60);
    let err = h.orchestrator.status("no-such-job").expect_err("unknown");
    assert!(matches!(err, StatusError::UnknownJob(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn report_artifact_lands_in_the_object_store() {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("app paths");
    let ledger = Arc::new(CreditLedger::open(&paths).expect("ledger"));
    let jobs = Arc::new(JobStore::open(&paths).expect("jobs"));
    let reports = Arc::new(ReportStore::open(&paths).expect("reports"));
    let store = Arc::new(FsObjectStore::builder().paths(paths).build());
    let objects: Arc<dyn ObjectStore> = Arc::clone(&store) as Arc<dyn ObjectStore>;
    let generate: Arc<dyn GenerateClient> = Arc::new(StubClient::healthy());
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .ledger(Arc::clone(&ledger))
            .jobs(jobs)
            .reports(Arc::clone(&reports))
            .objects(objects)
            .generate(generate)
            .backoff(ExponentialBuilder::default().with_min_delay(Duration::from_millis(1)))
            .config(GenerationConfig {
                section_workers: 4,
                max_attempts: 1,
                job_timeout_secs: 60,
            })
            .build(),
    );
    ledger.credit("u1", 1, CreditBucket::Free).expect("credit");

    let job_id = orchestrator.submit("u1", free_params()).expect("admitted");
    wait_terminal(&orchestrator, &job_id).await;

    let record = reports
        .find_by_user_and_slug("u1", "vegan-bakery")
        .expect("lookup")
        .expect("persisted");
    let bytes = store
        .download(&record.artifact_key)
        .await
        .expect("artifact uploaded");
    let content: BTreeMap<String, String> =
        serde_json::from_slice(&bytes).expect("artifact is the section map");
    assert_eq!(content.len(), 14);
}

struct CannedLinks;

#[async_trait]
impl LinkSearchClient for CannedLinks {
    async fn search(
        &self,
        queries: &[String],
        per_query_limit: usize,
    ) -> Result<Vec<QueryLinks>, LinkSearchError> {
        Ok(queries
            .iter()
            .map(|query| QueryLinks {
                query: query.clone(),
                urls: (0..per_query_limit)
                    .map(|i| format!("https://example.com/source/{i}"))
                    .collect(),
            })
            .collect())
    }
}

struct ByteFoldEmbed;

#[async_trait]
impl EmbedClient for ByteFoldEmbed {
    async fn embed_batch(
        &self,
        texts: &[&str],
        _task: EmbedTask,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0_f32; 4];
                for (i, b) in text.bytes().enumerate() {
                    v[i % 4] += f32::from(b) / 255.0;
                }
                v
            })
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn paid_job_publishes_its_corpus_and_rebuilds_the_index() {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("app paths");
    let ledger = Arc::new(CreditLedger::open(&paths).expect("ledger"));
    let jobs = Arc::new(JobStore::open(&paths).expect("jobs"));
    let reports = Arc::new(ReportStore::open(&paths).expect("reports"));
    let store = Arc::new(FsObjectStore::builder().paths(paths).build());
    let cache = Arc::new(
        RetrievalIndexCache::builder()
            .objects(Arc::clone(&store) as Arc<dyn ObjectStore>)
            .embed(Arc::new(ByteFoldEmbed) as Arc<dyn EmbedClient>)
            .dim(4)
            .chunk_size_chars(1000)
            .chunk_overlap_chars(0)
            .build(),
    );
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .ledger(Arc::clone(&ledger))
            .jobs(jobs)
            .reports(Arc::clone(&reports))
            .objects(Arc::clone(&store) as Arc<dyn ObjectStore>)
            .generate(Arc::new(StubClient::healthy()) as Arc<dyn GenerateClient>)
            .links(Arc::new(CannedLinks) as Arc<dyn LinkSearchClient>)
            .index_cache(Arc::clone(&cache))
            .backoff(ExponentialBuilder::default().with_min_delay(Duration::from_millis(1)))
            .config(GenerationConfig {
                section_workers: 4,
                max_attempts: 1,
                job_timeout_secs: 60,
            })
            .build(),
    );
    ledger.credit("u1", 1, CreditBucket::Paid).expect("credit");

    let job_id = orchestrator
        .submit(
            "u1",
            JobParams::Paid {
                idea_id: "idea1".to_string(),
                slug: "vegan-bakery".to_string(),
                idea: "a vegan bakery".to_string(),
                location: "Germany".to_string(),
            },
        )
        .expect("admitted");
    let (status, observed) = wait_terminal(&orchestrator, &job_id).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.progress.total, 8);
    assert_eq!(status.progress.step, 8);
    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "steps monotonic: {observed:?}");
    let result = status.result.expect("result stored");
    // 22 sections plus the shared summary and currency slots.
    assert_eq!(result.len(), 24);
    assert_eq!(result["currency"], "EUR");

    let balance = ledger.balance("u1").expect("balance");
    assert_eq!(balance.paid_credits, 0, "success keeps the debit");

    // The research corpus landed under its deterministic key.
    let corpus_key = corpus_artifact_key("u1", "idea1");
    let bytes = store
        .download(&corpus_key)
        .await
        .expect("corpus uploaded");
    let corpus: CorpusArtifact = serde_json::from_slice(&bytes).expect("corpus artifact shape");
    assert!(!corpus.summary.is_empty());
    assert!(corpus.summary.iter().all(|e| e.status == "summarized"));

    // The retrieval index was rebuilt over it: fingerprint marker and
    // serialized index persisted, and the corpus is searchable.
    assert!(store
        .exists(&fingerprint_marker_key("u1", &corpus_key))
        .await
        .expect("marker lookup"));
    assert!(store
        .exists(&index_blob_key("u1", &corpus_key))
        .await
        .expect("blob lookup"));
    let hits = cache
        .search("u1", &corpus_key, "generated text", 3)
        .await
        .expect("search")
        .expect("index has content");
    assert!(!hits.is_empty());
    assert!(hits[0].chunk.url.is_some(), "corpus chunks carry their source");
}
