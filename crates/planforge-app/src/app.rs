//! Application bootstrap: configuration resolved into opened stores and
//! wired services.

use std::sync::Arc;

use backon::ExponentialBuilder;
use tracing::info;

use crate::config::{self, AppConfig};
use crate::error::AppError;
use crate::index::cache::RetrievalIndexCache;
use crate::paths::AppPaths;
use crate::services::embed::EmbedClient;
use crate::services::generate::GenerateClient;
use crate::services::ledger::CreditLedger;
use crate::services::link_search::LinkSearchClient;
use crate::services::jobs::JobStore;
use crate::services::object_store::{FsObjectStore, ObjectStore};
use crate::services::orchestrator::Orchestrator;
use crate::services::refine::RefineService;
use crate::services::reports::ReportStore;

/// The opened stores every service hangs off. External clients (generation,
/// embedding, link search) stay caller-provided so deployments and tests
/// choose their own.
pub struct App {
    pub config: AppConfig,
    pub paths: AppPaths,
    pub ledger: Arc<CreditLedger>,
    pub jobs: Arc<JobStore>,
    pub reports: Arc<ReportStore>,
    pub objects: Arc<FsObjectStore>,
}

impl App {
    /// Load configuration from file/environment and open everything.
    pub fn bootstrap() -> Result<Self, AppError> {
        Self::open(config::load()?)
    }

    /// Open all stores under the configured storage root.
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        let paths = AppPaths::new(&config.storage.path)?;
        let ledger = Arc::new(CreditLedger::open(&paths)?);
        let jobs = Arc::new(JobStore::open(&paths)?);
        let reports = Arc::new(ReportStore::open(&paths)?);
        let objects = Arc::new(FsObjectStore::builder().paths(paths.clone()).build());
        info!(storage = %config.storage.path.display(), "stores opened");
        Ok(Self {
            config,
            paths,
            ledger,
            jobs,
            reports,
            objects,
        })
    }

    /// Wire the job orchestrator over this app's stores.
    pub fn orchestrator(
        &self,
        generate: Arc<dyn GenerateClient>,
        links: Option<Arc<dyn LinkSearchClient>>,
        index_cache: Option<Arc<RetrievalIndexCache>>,
    ) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::builder()
                .ledger(Arc::clone(&self.ledger))
                .jobs(Arc::clone(&self.jobs))
                .reports(Arc::clone(&self.reports))
                .objects(Arc::clone(&self.objects) as Arc<dyn ObjectStore>)
                .generate(generate)
                .maybe_links(links)
                .maybe_index_cache(index_cache)
                .backoff(ExponentialBuilder::default())
                .config(self.config.generation.clone())
                .build(),
        )
    }

    /// Build the retrieval index cache from this app's index configuration.
    pub fn index_cache(&self, embed: Arc<dyn EmbedClient>) -> Arc<RetrievalIndexCache> {
        Arc::new(
            RetrievalIndexCache::builder()
                .objects(Arc::clone(&self.objects) as Arc<dyn ObjectStore>)
                .embed(embed)
                .dim(self.config.index.embedding_dim)
                .chunk_size_chars(self.config.index.chunk_size_chars)
                .chunk_overlap_chars(self.config.index.chunk_overlap_chars)
                .cache_capacity(self.config.index.cache_capacity)
                .build(),
        )
    }

    /// Wire the grounded refinement service over a retrieval index cache.
    pub fn refine_service(
        &self,
        cache: Arc<RetrievalIndexCache>,
        generate: Arc<dyn GenerateClient>,
    ) -> RefineService {
        RefineService::builder()
            .cache(cache)
            .generate(generate)
            .backoff(ExponentialBuilder::default())
            .max_attempts(self.config.generation.max_attempts)
            .build()
    }
}
