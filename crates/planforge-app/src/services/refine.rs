//! Grounded refinement over a report's research corpus.
//!
//! A refinement question is answered only from retrieved chunks; when the
//! corpus holds nothing to ground on, the caller gets a typed signal
//! instead of an unsourced answer.

use std::sync::Arc;

use backon::ExponentialBuilder;
use thiserror::Error;
use tracing::debug;

use crate::constants::DEFAULT_TOP_K;
use crate::index::cache::{IndexCacheError, RetrievalIndexCache};
use crate::services::generate::{generate_with_retry, GenerateClient, GenerateError};

const ANSWER_MAX_TOKENS: u32 = 600;

#[derive(Debug, Error)]
pub enum RefineError {
    #[error(transparent)]
    Index(#[from] IndexCacheError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
}

/// How a refinement request resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum RefineOutcome {
    /// Answer built from retrieved context, with the source URLs it cites.
    Grounded { answer: String, sources: Vec<String> },
    /// Nothing retrievable to ground an answer on.
    NoGrounding,
}

/// Answers follow-up questions against one artifact's retrieval index.
#[derive(bon::Builder)]
pub struct RefineService {
    cache: Arc<RetrievalIndexCache>,
    generate: Arc<dyn GenerateClient>,
    backoff: ExponentialBuilder,
    max_attempts: usize,
    #[builder(default = DEFAULT_TOP_K)]
    top_k: usize,
}

impl RefineService {
    pub async fn answer(
        &self,
        user_id: &str,
        artifact_key: &str,
        question: &str,
    ) -> Result<RefineOutcome, RefineError> {
        debug_assert!(!question.is_empty());

        let hits = match self
            .cache
            .search(user_id, artifact_key, question, self.top_k)
            .await?
        {
            Some(hits) if !hits.is_empty() => hits,
            _ => {
                debug!(user_id, artifact_key, "no grounding material for refinement");
                return Ok(RefineOutcome::NoGrounding);
            }
        };

        let mut context = String::new();
        let mut sources: Vec<String> = Vec::new();
        for hit in &hits {
            context.push_str(&hit.chunk.text);
            context.push_str("\n---\n");
            if let Some(url) = &hit.chunk.url {
                if !sources.contains(url) {
                    sources.push(url.clone());
                }
            }
        }

        let prompt = format!(
            "Answer the question below using only the provided context. If the \
             context does not contain the answer, say so plainly.\n\n\
             Context:\n{context}\n\
             Question: {question}"
        );
        let mut answer = generate_with_retry(
            self.generate.as_ref(),
            &prompt,
            ANSWER_MAX_TOKENS,
            &self.backoff,
            self.max_attempts,
        )
        .await?;

        if !sources.is_empty() {
            answer.push_str("\n\n**Sources:**\n");
            for url in &sources {
                answer.push_str("- ");
                answer.push_str(url);
                answer.push('\n');
            }
        }
        Ok(RefineOutcome::Grounded { answer, sources })
    }
}
