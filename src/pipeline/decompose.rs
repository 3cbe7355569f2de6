//! Query decomposition: one structured model call that turns the user's
//! question into a rewritten retrieval query, a keyword query and structured
//! search filters.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::corpus::SearchFilters;
use crate::gateway::Attribution;
use crate::llm::{CallOptions, Completion, ModelClient, ModelError, ModelLadder};
use crate::prompts::QUERY_DECOMPOSER_PROMPT;

/// The decomposed form of a user query.
#[derive(Debug, Clone, Serialize)]
pub struct DecomposedQuery {
    pub rewritten_query: String,
    pub keyword_query: String,
    pub filters: SearchFilters,
    /// True when decomposition failed and the raw query was used as-is.
    pub degraded: bool,
}

impl DecomposedQuery {
    /// The trivial decomposition: rewritten = keyword = original, no filters.
    pub fn trivial(query: &str) -> Self {
        Self {
            rewritten_query: query.to_string(),
            keyword_query: query.to_string(),
            filters: SearchFilters::default(),
            degraded: true,
        }
    }
}

/// Wire schema the decomposer model is prompted to produce.
#[derive(Debug, Deserialize)]
struct DecomposerJson {
    rewritten_query: Option<String>,
    #[serde(default)]
    keyword_query: Option<String>,
    #[serde(default)]
    earliest_search_year: Option<i32>,
    #[serde(default)]
    latest_search_year: Option<i32>,
    #[serde(default)]
    venues: Vec<String>,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    fields_of_study: Vec<String>,
}

/// Decompose `query`. Schema violations after retries degrade to the trivial
/// decomposition rather than failing the task.
///
/// Returns the decomposition and the usage of the underlying call, if one
/// succeeded.
pub async fn decompose_query(
    client: &ModelClient,
    models: &ModelLadder,
    query: &str,
    attribution: Attribution,
    cancel: &CancelToken,
) -> Result<(DecomposedQuery, Option<Completion>), ModelError> {
    let opts = CallOptions {
        max_output_tokens: 1024,
        ..Default::default()
    };

    let result = client
        .complete_structured::<DecomposerJson>(
            models,
            QUERY_DECOMPOSER_PROMPT,
            query,
            &opts,
            attribution,
            cancel,
        )
        .await;

    match result {
        Ok((parsed, completion)) => {
            let rewritten = parsed
                .rewritten_query
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| query.to_string());
            // The model reports inclusive years; filters carry a half-open
            // interval.
            let filters = SearchFilters {
                year_start: parsed.earliest_search_year,
                year_end: parsed.latest_search_year.map(|y| y + 1),
                venues: parsed.venues.into_iter().filter(|v| !v.is_empty()).collect(),
                authors: parsed.authors.into_iter().filter(|a| !a.is_empty()).collect(),
                fields_of_study: parsed
                    .fields_of_study
                    .into_iter()
                    .filter(|f| !f.is_empty())
                    .collect(),
            };
            Ok((
                DecomposedQuery {
                    rewritten_query: rewritten,
                    keyword_query: parsed.keyword_query.unwrap_or_default(),
                    filters,
                    degraded: false,
                },
                Some(completion),
            ))
        }
        Err(ModelError::SchemaViolation(err)) => {
            warn!(error = %err, "query decomposition failed; using trivial decomposition");
            Ok((DecomposedQuery::trivial(query), None))
        }
        Err(other) => Err(other),
    }
}
