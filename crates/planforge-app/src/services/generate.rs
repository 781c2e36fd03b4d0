//! Content-generation client abstraction with typed failures and
//! retry-with-backoff for the transient ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::RateLimiter;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

pub type GenericRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Failure modes of one content-generation call.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("rate limited by content generation api")]
    RateLimited,

    #[error("transient content generation failure: {0}")]
    Transient(String),

    #[error("content generation rejected the request: {0}")]
    Fatal(String),
}

impl GenerateError {
    /// Rate limits and transient failures are worth another attempt;
    /// malformed requests are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerateError::RateLimited | GenerateError::Transient(_))
    }
}

/// Stateless wrapper around an external generative-content API.
#[async_trait]
pub trait GenerateClient: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerateError>;
}

/// Call the client, retrying retryable failures with exponential backoff.
///
/// `max_attempts` counts the first try; fatal errors and exhaustion both
/// surface the last error to the caller.
pub async fn generate_with_retry(
    client: &dyn GenerateClient,
    prompt: &str,
    max_tokens: u32,
    backoff: &ExponentialBuilder,
    max_attempts: usize,
) -> Result<String, GenerateError> {
    debug_assert!(max_attempts > 0);
    debug_assert!(!prompt.is_empty());

    let retries = max_attempts.saturating_sub(1);
    (|| async { client.generate(prompt, max_tokens).await })
        .retry(backoff.clone().with_max_times(retries))
        .when(GenerateError::is_retryable)
        .notify(|err: &GenerateError, delay: Duration| {
            warn!(
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "retrying content generation"
            );
        })
        .await
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct HttpGenerateClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    limiter: Option<Arc<GenericRateLimiter>>,
}

impl HttpGenerateClient {
    pub fn from_env(
        model: impl Into<String>,
        limiter: Option<Arc<GenericRateLimiter>>,
    ) -> Result<Self, GenerateError> {
        let api_key = std::env::var("PLANFORGE_GENERATION_API_KEY").map_err(|_| {
            GenerateError::Fatal(
                "missing PLANFORGE_GENERATION_API_KEY environment variable".to_string(),
            )
        })?;
        let base_url = std::env::var("PLANFORGE_GENERATION_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            model: model.into(),
            api_key,
            limiter,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl GenerateClient for HttpGenerateClient {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerateError> {
        debug_assert!(!prompt.is_empty());
        debug_assert!(max_tokens > 0);

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
        });
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerateError::RateLimited);
        }
        if status.is_server_error() {
            return Err(GenerateError::Transient(format!("server returned {status}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GenerateError::Fatal(format!("{status}: {detail}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::Transient(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerateError::Transient("response carried no choices".to_string()))
    }
}
