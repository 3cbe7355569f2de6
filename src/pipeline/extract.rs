//! Evidence extraction: per-paper fan-out of model calls that pull verbatim
//! supporting quotes out of each paper's merged text.

use std::future::Future;
use std::pin::Pin;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::gateway::Attribution;
use crate::llm::{CallOptions, Completion, ModelClient, ModelError, ModelLadder};
use crate::paper_finder::PaperAggregate;
use crate::prompts::QUOTE_EXTRACTION_PROMPT;

/// One verbatim quote from a paper.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    /// Index of the quote within its paper's set.
    pub index: usize,
    pub text: String,
}

/// All quotes extracted from one paper.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteSet {
    pub reference_number: u32,
    pub corpus_id: String,
    pub reference_string: String,
    pub quotes: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct QuotesJson {
    #[serde(default)]
    quotes: Vec<String>,
}

/// Outcome of the extraction stage.
#[derive(Debug)]
pub struct ExtractOutput {
    /// Papers that yielded at least one valid quote, ascending by reference
    /// number.
    pub quote_sets: Vec<QuoteSet>,
    pub warnings: Vec<String>,
    /// Per-call usage for cost accounting.
    pub completions: Vec<Completion>,
}

/// Extract quotes from every paper with a bounded worker fan-out.
///
/// Single-paper failures drop the paper with a warning; quotes failing the
/// verbatim substring check are discarded. Workers complete out of order and
/// the result is collated ascending by reference number.
fn extract_one<'a>(
    client: &'a ModelClient,
    models: &'a ModelLadder,
    query: &'a str,
    paper: &'a PaperAggregate,
    attribution: Attribution,
    cancel: &'a CancelToken,
) -> Pin<Box<dyn Future<Output = (u32, Result<(QuotesJson, Completion), ModelError>)> + Send + 'a>>
{
    Box::pin(async move {
        let user_text = format!(
            "## Question\n{query}\n\n## Paper {}\n{}",
            paper.reference_string, paper.merged_text
        );
        let opts = CallOptions {
            max_output_tokens: 2048,
            ..Default::default()
        };
        let result = client
            .complete_structured::<QuotesJson>(
                models,
                QUOTE_EXTRACTION_PROMPT,
                &user_text,
                &opts,
                attribution,
                cancel,
            )
            .await;
        (paper.reference_number, result)
    })
}

pub async fn extract_quotes(
    client: &ModelClient,
    models: &ModelLadder,
    query: &str,
    papers: &[PaperAggregate],
    max_workers: usize,
    attribution: Attribution,
    cancel: &CancelToken,
) -> Result<ExtractOutput, ModelError> {
    let mut pending = Vec::with_capacity(papers.len());
    for paper in papers.iter() {
        pending.push(extract_one(
            client,
            models,
            query,
            paper,
            attribution.clone(),
            cancel,
        ));
    }
    let results: Vec<(u32, Result<(QuotesJson, Completion), ModelError>)> = stream::iter(pending)
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await;

    cancel.check().map_err(ModelError::Interrupted)?;

    let mut warnings = Vec::new();
    let mut completions = Vec::new();
    let mut quote_sets = Vec::new();

    for (reference_number, result) in results {
        let paper = papers
            .iter()
            .find(|p| p.reference_number == reference_number)
            .expect("reference number from the same slice");

        match result {
            Ok((parsed, completion)) => {
                completions.push(completion);
                let mut quotes = Vec::new();
                for text in parsed.quotes {
                    let trimmed = text.trim();
                    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                        continue;
                    }
                    // Every quote must appear verbatim in the merged text.
                    if !paper.merged_text.contains(trimmed) {
                        warnings.push(format!(
                            "paper [{reference_number}]: discarded non-verbatim quote"
                        ));
                        continue;
                    }
                    quotes.push(Quote {
                        index: quotes.len(),
                        text: trimmed.to_string(),
                    });
                }
                if quotes.is_empty() {
                    warnings.push(format!("paper [{reference_number}]: no usable quotes"));
                    continue;
                }
                quote_sets.push(QuoteSet {
                    reference_number,
                    corpus_id: paper.corpus_id.clone(),
                    reference_string: paper.reference_string.clone(),
                    quotes,
                });
            }
            Err(ModelError::Interrupted(reason)) => {
                return Err(ModelError::Interrupted(reason));
            }
            Err(err) => {
                warn!(reference_number, error = %err, "quote extraction failed for paper");
                warnings.push(format!("paper [{reference_number}]: extraction failed ({err})"));
            }
        }
    }

    quote_sets.sort_by_key(|qs| qs.reference_number);

    Ok(ExtractOutput {
        quote_sets,
        warnings,
        completions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_json_tolerates_missing_field() {
        let parsed: QuotesJson = serde_json::from_str("{}").unwrap();
        assert!(parsed.quotes.is_empty());
    }
}
