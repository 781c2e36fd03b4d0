//! Fan-out/fan-in report generation.
//!
//! One sequential shared-context step (summary, then currency with strict
//! output validation), then every section task runs concurrently through a
//! bounded pool. A section that exhausts its retries contributes an in-band
//! error placeholder; only a shared-context failure aborts the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use backon::ExponentialBuilder;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::constants::FALLBACK_CURRENCY;
use crate::services::generate::{generate_with_retry, GenerateClient, GenerateError};
use crate::services::sections::{currency_prompt, summary_prompt, Section, SharedContext};

const SUMMARY_MAX_TOKENS: u32 = 300;
const CURRENCY_MAX_TOKENS: u32 = 10;
const SECTION_MAX_TOKENS: u32 = 800;

/// Section name → generated Markdown (or an error placeholder).
pub type SectionMap = BTreeMap<String, String>;

/// Key under which the shared summary is stored in the assembled report.
pub const SUMMARY_SECTION: &str = "overall_context_summary";

/// Key under which the resolved currency is stored in the assembled report.
pub const CURRENCY_SECTION: &str = "currency";

/// Accept only a bare 3-letter uppercase code.
#[must_use]
pub fn validate_currency_code(raw: &str) -> Option<String> {
    let code = raw.trim();
    let valid = code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase());
    valid.then(|| code.to_string())
}

/// Sequential step 1: compute the shared summary and currency.
///
/// A summary failure fails the whole run because every section depends on
/// it. Currency detection is best-effort: an invalid answer or a failed
/// call silently falls back to [`FALLBACK_CURRENCY`].
pub async fn compute_shared_context(
    client: &dyn GenerateClient,
    idea: &str,
    location: &str,
    backoff: &ExponentialBuilder,
    max_attempts: usize,
) -> Result<SharedContext, GenerateError> {
    debug_assert!(!idea.is_empty());
    debug_assert!(!location.is_empty());

    let summary = generate_with_retry(
        client,
        &summary_prompt(idea, location),
        SUMMARY_MAX_TOKENS,
        backoff,
        max_attempts,
    )
    .await?;

    let currency = match generate_with_retry(
        client,
        &currency_prompt(location),
        CURRENCY_MAX_TOKENS,
        backoff,
        max_attempts,
    )
    .await
    {
        Ok(raw) => validate_currency_code(&raw).unwrap_or_else(|| {
            debug!(location, raw, "currency answer failed validation, using fallback");
            FALLBACK_CURRENCY.to_string()
        }),
        Err(err) => {
            warn!(location, error = %err, "currency detection failed, using fallback");
            FALLBACK_CURRENCY.to_string()
        }
    };

    Ok(SharedContext { summary, currency })
}

/// Parallel step 2 + aggregation: run every section through a bounded pool.
///
/// The returned map always holds exactly one slot per requested section;
/// failed sections hold an `Error generating {name}: …` placeholder. Sibling
/// tasks are never aborted by one section's failure.
pub async fn generate_sections(
    client: Arc<dyn GenerateClient>,
    sections: &[Section],
    idea: &str,
    location: &str,
    shared: &SharedContext,
    workers: usize,
    backoff: &ExponentialBuilder,
    max_attempts: usize,
) -> SectionMap {
    debug_assert!(!sections.is_empty());

    // Pre-fill every slot so aggregation is total even if a task is lost.
    let mut results: SectionMap = sections
        .iter()
        .map(|section| {
            (
                section.name.to_string(),
                format!("Error generating {}: task aborted", section.name),
            )
        })
        .collect();

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks: JoinSet<(&'static str, String)> = JoinSet::new();
    for section in sections {
        let client = Arc::clone(&client);
        let semaphore = Arc::clone(&semaphore);
        let prompt = section.prompt(idea, location, shared);
        let backoff = backoff.clone();
        let name = section.name;
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            match generate_with_retry(
                client.as_ref(),
                &prompt,
                SECTION_MAX_TOKENS,
                &backoff,
                max_attempts,
            )
            .await
            {
                Ok(content) => (name, content),
                Err(err) => {
                    warn!(section = name, error = %err, "section exhausted its retries");
                    (name, format!("Error generating {name}: {err}"))
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, content)) => {
                results.insert(name.to_string(), content);
            }
            Err(err) => {
                warn!(error = %err, "section task failed to join");
            }
        }
    }

    results
}

/// Fold the shared context into the section map to form the final report
/// content.
#[must_use]
pub fn assemble(shared: &SharedContext, sections: SectionMap) -> SectionMap {
    let mut out = sections;
    out.insert(SUMMARY_SECTION.to_string(), shared.summary.clone());
    out.insert(CURRENCY_SECTION.to_string(), shared.currency.clone());
    out
}
