//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_CHUNK_OVERLAP_CHARS, DEFAULT_CHUNK_SIZE_CHARS, DEFAULT_EMBEDDING_DIM,
};

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub generation: GenerationConfig,
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Concurrent section tasks per job.
    pub section_workers: usize,
    /// Total attempts per content-generation call, first try included.
    pub max_attempts: usize,
    /// Wall-clock budget for one job's running phase.
    pub job_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            section_workers: 10,
            max_attempts: 3,
            job_timeout_secs: 1500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,
    /// Dimensionality requested from the embedding API.
    pub embedding_dim: usize,
    /// Loaded indices kept in process; 0 keeps every index for the process lifetime.
    pub cache_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_size_chars: DEFAULT_CHUNK_SIZE_CHARS,
            chunk_overlap_chars: DEFAULT_CHUNK_OVERLAP_CHARS,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            cache_capacity: 0,
        }
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let generation = GenerationConfig::default();
    let index = IndexConfig::default();
    let builder = Config::builder()
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default(
            "generation.section_workers",
            generation.section_workers as i64,
        )?
        .set_default("generation.max_attempts", generation.max_attempts as i64)?
        .set_default(
            "generation.job_timeout_secs",
            generation.job_timeout_secs as i64,
        )?
        .set_default("index.chunk_size_chars", index.chunk_size_chars as i64)?
        .set_default(
            "index.chunk_overlap_chars",
            index.chunk_overlap_chars as i64,
        )?
        .set_default("index.embedding_dim", index.embedding_dim as i64)?
        .set_default("index.cache_capacity", index.cache_capacity as i64)?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("PLANFORGE").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "planforge", "planforge").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
