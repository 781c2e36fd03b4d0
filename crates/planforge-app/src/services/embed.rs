//! Embedding client abstraction and its HTTP implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::services::generate::GenericRateLimiter;

const ZERO_VECTOR_VALUE: f32 = 0.0;

/// Whether a batch embeds corpus documents or a retrieval query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedTask {
    Document,
    Query,
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("{0}")]
    Message(String),

    #[error("rate limited by embedding api")]
    RateLimited,
}

impl EmbedError {
    pub fn message(msg: impl Into<String>) -> Self {
        EmbedError::Message(msg.into())
    }
}

/// Maps each input text to one dense vector, preserving order.
#[async_trait]
pub trait EmbedClient: Send + Sync {
    async fn embed_batch(
        &self,
        texts: &[&str],
        task: EmbedTask,
    ) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// OpenAI-compatible embeddings client.
///
/// Whitespace-only inputs are mapped to zero vectors locally instead of
/// being sent upstream; non-empty inputs are embedded in bounded batches
/// behind the optional rate limiter.
#[derive(Clone)]
pub struct HttpEmbedClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    dim: usize,
    limiter: Option<Arc<GenericRateLimiter>>,
    max_batch: usize,
}

impl HttpEmbedClient {
    pub fn from_env(
        model: impl Into<String>,
        dim: usize,
        limiter: Option<Arc<GenericRateLimiter>>,
        max_batch: usize,
    ) -> Result<Self, EmbedError> {
        if dim == 0 {
            return Err(EmbedError::message(
                "embedding dimension must be greater than zero",
            ));
        }
        let api_key = std::env::var("PLANFORGE_EMBEDDING_API_KEY").map_err(|_| {
            EmbedError::message("missing PLANFORGE_EMBEDDING_API_KEY environment variable")
        })?;
        let base_url = std::env::var("PLANFORGE_EMBEDDING_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            model: model.into(),
            api_key,
            dim,
            limiter,
            max_batch: max_batch.max(1),
        })
    }

    async fn run_embedding(&self, payloads: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        debug_assert!(!self.model.is_empty());
        debug_assert!(self.dim > 0);

        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let mut outputs: Vec<Vec<f32>> = Vec::with_capacity(payloads.len());
        let mut offset = 0_usize;
        while offset < payloads.len() {
            let end = (offset + self.max_batch).min(payloads.len());
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }
            let chunk_slice = &payloads[offset..end];
            let vectors = self.request_batch(chunk_slice).await?;
            if vectors.len() != chunk_slice.len() {
                return Err(EmbedError::message(format!(
                    "embedding count mismatch: expected {}, got {}",
                    chunk_slice.len(),
                    vectors.len()
                )));
            }
            outputs.extend(vectors);
            offset = end;
        }

        Ok(outputs)
    }

    async fn request_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dim,
        });
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::message(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbedError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EmbedError::message(format!("{status}: {detail}")));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::message(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbedClient for HttpEmbedClient {
    async fn embed_batch(
        &self,
        texts: &[&str],
        _task: EmbedTask,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        debug_assert!(self.dim > 0);

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut non_empty_indices: Vec<usize> = Vec::new();
        let mut non_empty_payloads: Vec<&str> = Vec::new();

        for (idx, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                results.push(Some(vec![ZERO_VECTOR_VALUE; self.dim]));
                continue;
            }
            results.push(None);
            non_empty_indices.push(idx);
            non_empty_payloads.push(*text);
        }

        if !non_empty_payloads.is_empty() {
            let vectors = self.run_embedding(&non_empty_payloads).await?;
            for (idx, vector) in non_empty_indices.into_iter().zip(vectors.into_iter()) {
                if vector.len() != self.dim {
                    return Err(EmbedError::message(format!(
                        "expected embedding dimension {}, got {}",
                        self.dim,
                        vector.len()
                    )));
                }
                results[idx] = Some(vector);
            }
        }

        let mut finalized: Vec<Vec<f32>> = Vec::with_capacity(results.len());
        for value in results.into_iter() {
            match value {
                Some(vector) => finalized.push(vector),
                None => {
                    return Err(EmbedError::message("internal error: missing embedding result"));
                }
            }
        }

        Ok(finalized)
    }
}
