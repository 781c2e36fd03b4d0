//! Persistence for generated report records.

use std::collections::BTreeMap;

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::services::jobs::{current_timestamp_ms, AccessLevel};

const REPORT_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

/// One persisted report. Upgrades mutate the record in place rather than
/// creating a sibling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRecord {
    pub report_id: String,
    pub user_id: String,
    pub idea_id: String,
    pub slug: String,
    pub access_level: AccessLevel,
    pub sections: BTreeMap<String, String>,
    /// Object-store key of the uploaded report artifact.
    pub artifact_key: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ReportRecord {
    #[must_use]
    pub fn new(
        report_id: impl Into<String>,
        user_id: impl Into<String>,
        idea_id: impl Into<String>,
        slug: impl Into<String>,
        access_level: AccessLevel,
        sections: BTreeMap<String, String>,
        artifact_key: impl Into<String>,
    ) -> Self {
        let report_id = report_id.into();
        debug_assert!(!report_id.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            report_id,
            user_id: user_id.into(),
            idea_id: idea_id.into(),
            slug: slug.into(),
            access_level,
            sections,
            artifact_key: artifact_key.into(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

/// Errors emitted by the report record store.
#[derive(Debug, Error)]
pub enum ReportStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("report `{0}` already exists")]
    Duplicate(String),
    #[error("report `{0}` not found")]
    NotFound(String),
}

/// LMDB-backed persistence for report records, keyed by report id.
#[derive(Debug)]
pub struct ReportStore {
    env: Env,
    reports: Database<Str, Bytes>,
}

impl ReportStore {
    pub fn open(paths: &AppPaths) -> Result<Self, ReportStoreError> {
        let path = paths.reports_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(REPORT_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let reports = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("reports"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("reports"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, reports })
    }

    pub fn insert(&self, record: &ReportRecord) -> Result<(), ReportStoreError> {
        debug_assert!(!record.report_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        if self.reports.get(&wtxn, record.report_id.as_str())?.is_some() {
            return Err(ReportStoreError::Duplicate(record.report_id.clone()));
        }
        let encoded = encode_to_vec(record, config::standard())?;
        self.reports
            .put(&mut wtxn, record.report_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, report_id: &str) -> Result<Option<ReportRecord>, ReportStoreError> {
        debug_assert!(!report_id.is_empty());
        let rtxn = self.env.read_txn()?;
        let value = self.reports.get(&rtxn, report_id)?;
        if let Some(raw) = value {
            let (record, _) = decode_from_slice::<ReportRecord, _>(raw, config::standard())?;
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Resolve the report a user created for a given idea slug.
    pub fn find_by_user_and_slug(
        &self,
        user_id: &str,
        slug: &str,
    ) -> Result<Option<ReportRecord>, ReportStoreError> {
        debug_assert!(!user_id.is_empty());
        let rtxn = self.env.read_txn()?;
        let iter = self.reports.iter(&rtxn)?;
        for entry in iter {
            let (_, raw) = entry?;
            let (record, _) = decode_from_slice::<ReportRecord, _>(raw, config::standard())?;
            if record.user_id == user_id && record.slug == slug {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Replace a record's content and access level in place, keeping its
    /// identity and artifact key. This is the upgrade path.
    pub fn replace_content(
        &self,
        report_id: &str,
        access_level: AccessLevel,
        sections: BTreeMap<String, String>,
    ) -> Result<ReportRecord, ReportStoreError> {
        debug_assert!(!report_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let existing = self.reports.get(&wtxn, report_id)?;
        let Some(raw) = existing else {
            return Err(ReportStoreError::NotFound(report_id.to_string()));
        };
        let (mut record, _) = decode_from_slice::<ReportRecord, _>(raw, config::standard())?;
        record.access_level = access_level;
        record.sections = sections;
        record.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&record, config::standard())?;
        self.reports.put(&mut wtxn, report_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(record)
    }
}
