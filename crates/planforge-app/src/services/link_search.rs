//! Bounded web-link discovery used to gather source material for paid reports.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// The links found for one query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLinks {
    pub query: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LinkSearchError {
    #[error("{0}")]
    Message(String),
}

impl LinkSearchError {
    pub fn message(msg: impl Into<String>) -> Self {
        LinkSearchError::Message(msg.into())
    }
}

/// Given a batch of query strings, returns a bounded list of URLs per query.
#[async_trait]
pub trait LinkSearchClient: Send + Sync {
    async fn search(
        &self,
        queries: &[String],
        per_query_limit: usize,
    ) -> Result<Vec<QueryLinks>, LinkSearchError>;
}

/// JSON search-API client. A query whose request fails contributes an empty
/// URL list rather than failing the whole batch.
#[derive(Clone)]
pub struct HttpLinkSearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLinkSearchClient {
    pub fn from_env() -> Result<Self, LinkSearchError> {
        let api_key = std::env::var("PLANFORGE_SEARCH_API_KEY").map_err(|_| {
            LinkSearchError::message("missing PLANFORGE_SEARCH_API_KEY environment variable")
        })?;
        let base_url = std::env::var("PLANFORGE_SEARCH_BASE_URL")
            .unwrap_or_else(|_| "https://www.googleapis.com/customsearch/v1".to_string());
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
        })
    }

    async fn search_one(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<String>, LinkSearchError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", query),
                ("num", &limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| LinkSearchError::message(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LinkSearchError::message(format!("search returned {status}")));
        }
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| LinkSearchError::message(e.to_string()))?;
        let mut urls: Vec<String> = parsed.items.into_iter().map(|item| item.link).collect();
        urls.truncate(limit);
        Ok(urls)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    link: String,
}

#[async_trait]
impl LinkSearchClient for HttpLinkSearchClient {
    async fn search(
        &self,
        queries: &[String],
        per_query_limit: usize,
    ) -> Result<Vec<QueryLinks>, LinkSearchError> {
        debug_assert!(per_query_limit > 0);

        let mut out = Vec::with_capacity(queries.len());
        for query in queries {
            let urls = match self.search_one(query, per_query_limit).await {
                Ok(urls) => urls,
                Err(err) => {
                    warn!(query, error = %err, "link search failed for query");
                    Vec::new()
                }
            };
            out.push(QueryLinks {
                query: query.clone(),
                urls,
            });
        }
        Ok(out)
    }
}
