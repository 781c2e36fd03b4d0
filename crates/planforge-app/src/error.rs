//! Top-level error type aggregating every subsystem failure.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::index::cache::IndexCacheError;
use crate::index::chunk::ChunkError;
use crate::paths::PathError;
use crate::services::corpus::CorpusError;
use crate::services::embed::EmbedError;
use crate::services::generate::GenerateError;
use crate::services::jobs::JobStoreError;
use crate::services::ledger::LedgerError;
use crate::services::link_search::LinkSearchError;
use crate::services::object_store::ObjectStoreError;
use crate::services::orchestrator::{StatusError, SubmitError};
use crate::services::refine::RefineError;
use crate::services::reports::ReportStoreError;

/// Everything that can go wrong across the application, for callers that
/// want a single error surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Reports(#[from] ReportStoreError),
    #[error(transparent)]
    Objects(#[from] ObjectStoreError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    LinkSearch(#[from] LinkSearchError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Index(#[from] IndexCacheError),
    #[error(transparent)]
    Refine(#[from] RefineError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Status(#[from] StatusError),
}
