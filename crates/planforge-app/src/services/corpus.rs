//! Source-material gathering for paid reports.
//!
//! Evaluation headings for the idea are expanded into search queries, the
//! queries are resolved to URLs, and each (query, url) pair is summarized
//! concurrently. The resulting entries form the corpus artifact that later
//! feeds the retrieval index.

use std::sync::Arc;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::services::generate::{generate_with_retry, GenerateClient, GenerateError};
use crate::services::link_search::{LinkSearchClient, LinkSearchError};

const HEADINGS_MAX_TOKENS: u32 = 200;
const QUERIES_MAX_TOKENS: u32 = 200;
const SOURCE_SUMMARY_MAX_TOKENS: u32 = 400;

/// URLs fetched per search query.
pub const LINKS_PER_QUERY: usize = 3;

/// One summarized source in the corpus artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub category: String,
    pub status: String,
    pub term: String,
    pub url: String,
    pub summary: String,
}

/// The corpus artifact uploaded to the object store as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusArtifact {
    pub summary: Vec<CorpusEntry>,
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    LinkSearch(#[from] LinkSearchError),
}

/// Ask for evaluation headings, then expand each heading into search
/// queries. A failure here fails the corpus step: without queries there is
/// nothing to gather.
pub async fn plan_queries(
    client: &dyn GenerateClient,
    idea: &str,
    location: &str,
    backoff: &ExponentialBuilder,
    max_attempts: usize,
) -> Result<Vec<String>, CorpusError> {
    debug_assert!(!idea.is_empty());

    let headings_prompt = format!(
        "List the evaluation headings needed to assess the business idea '{idea}' \
         in '{location}'. One heading per line, no numbering, at most 6 lines."
    );
    let headings_raw = generate_with_retry(
        client,
        &headings_prompt,
        HEADINGS_MAX_TOKENS,
        backoff,
        max_attempts,
    )
    .await?;
    let headings = parse_lines(&headings_raw);

    let mut queries = Vec::new();
    for heading in &headings {
        let queries_prompt = format!(
            "Write 3 concrete web search queries that would gather evidence for the \
             heading '{heading}' when evaluating the business idea '{idea}' in \
             '{location}'. One query per line, no numbering."
        );
        let raw = generate_with_retry(
            client,
            &queries_prompt,
            QUERIES_MAX_TOKENS,
            backoff,
            max_attempts,
        )
        .await?;
        queries.extend(parse_lines(&raw));
    }
    debug!(headings = headings.len(), queries = queries.len(), "planned corpus queries");
    Ok(queries)
}

/// Resolve queries to (query, url) pairs, deduplicating URLs across queries.
pub async fn collect_links(
    client: &dyn LinkSearchClient,
    queries: &[String],
    per_query_limit: usize,
) -> Result<Vec<(String, String)>, CorpusError> {
    let batches = client.search(queries, per_query_limit).await?;
    let mut seen: Vec<String> = Vec::new();
    let mut pairs = Vec::new();
    for batch in batches {
        for url in batch.urls {
            if seen.contains(&url) {
                continue;
            }
            seen.push(url.clone());
            pairs.push((batch.query.clone(), url));
        }
    }
    Ok(pairs)
}

/// Summarize every (query, url) pair through a bounded pool. A pair whose
/// summarization fails is skipped; the corpus degrades instead of failing.
pub async fn summarize_sources(
    client: Arc<dyn GenerateClient>,
    pairs: Vec<(String, String)>,
    workers: usize,
    backoff: &ExponentialBuilder,
    max_attempts: usize,
) -> Vec<CorpusEntry> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks: JoinSet<Option<CorpusEntry>> = JoinSet::new();
    for (query, url) in pairs {
        let client = Arc::clone(&client);
        let semaphore = Arc::clone(&semaphore);
        let backoff = backoff.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let prompt = format!(
                "Summarize what the page at {url} would contribute to researching \
                 the query '{query}'. Plain text, at most 120 words."
            );
            match generate_with_retry(
                client.as_ref(),
                &prompt,
                SOURCE_SUMMARY_MAX_TOKENS,
                &backoff,
                max_attempts,
            )
            .await
            {
                Ok(summary) => Some(CorpusEntry {
                    category: "research".to_string(),
                    status: "summarized".to_string(),
                    term: query,
                    url,
                    summary,
                }),
                Err(err) => {
                    warn!(url, error = %err, "source summarization skipped");
                    None
                }
            }
        });
    }

    let mut entries = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "source summary task failed to join"),
        }
    }
    // Deterministic artifact ordering regardless of completion order.
    entries.sort_by(|a, b| a.url.cmp(&b.url));
    entries
}

fn parse_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', ' ']).to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
