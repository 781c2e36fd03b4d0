//! Artifact parsing and text chunking for the retrieval index.
//!
//! Two artifact shapes are indexable: the research corpus (a `summary`
//! array of entries) and a persisted report (a flat map of section name to
//! Markdown). Both flatten into source records, which are then split into
//! overlapping character windows.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::corpus::CorpusArtifact;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("artifact is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("artifact shape is not indexable")]
    UnknownShape,
}

/// One flattened piece of source text, before windowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub text: String,
    pub url: Option<String>,
}

/// One indexed window of text, carried alongside its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub url: Option<String>,
}

/// Flatten an artifact's JSON bytes into source records.
pub fn parse_artifact(bytes: &[u8]) -> Result<Vec<SourceRecord>, ChunkError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.get("summary").is_some_and(serde_json::Value::is_array) {
        let corpus: CorpusArtifact = serde_json::from_value(value)?;
        return Ok(corpus
            .summary
            .into_iter()
            .map(|entry| SourceRecord {
                text: format!(
                    "Category: {}\nStatus: {}\nTerm: {}\nSummary: {}",
                    entry.category, entry.status, entry.term, entry.summary
                ),
                url: Some(entry.url),
            })
            .collect());
    }
    if let Some(map) = value.as_object() {
        if map.values().all(serde_json::Value::is_string) {
            return Ok(map
                .iter()
                .filter_map(|(name, text)| {
                    let text = text.as_str()?;
                    if text.trim().is_empty() {
                        return None;
                    }
                    Some(SourceRecord {
                        text: format!("{name}: {text}"),
                        url: None,
                    })
                })
                .collect());
        }
    }
    Err(ChunkError::UnknownShape)
}

/// Split records into overlapping windows of `chunk_size` characters.
///
/// Windows are cut on character boundaries, so multi-byte text never
/// produces an invalid slice. The step is always positive, so chunking
/// terminates for any size and overlap combination.
#[must_use]
pub fn chunk_records(records: &[SourceRecord], chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    let mut chunks = Vec::new();
    for record in records {
        for window in chunk_text(&record.text, chunk_size, overlap) {
            chunks.push(Chunk {
                text: window,
                url: record.url.clone(),
            });
        }
    }
    chunks
}

fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    debug_assert!(chunk_size > overlap);

    if text.trim().is_empty() {
        return Vec::new();
    }
    // Byte offset of every character boundary, final boundary included.
    let mut bounds: Vec<usize> = text.char_indices().map(|(offset, _)| offset).collect();
    bounds.push(text.len());
    let char_count = bounds.len() - 1;

    let mut windows = Vec::new();
    let mut start = 0_usize;
    while start < char_count {
        let end = (start + chunk_size).min(char_count);
        windows.push(text[bounds[start]..bounds[end]].to_string());
        if end == char_count {
            break;
        }
        start = end - overlap;
    }
    windows
}
