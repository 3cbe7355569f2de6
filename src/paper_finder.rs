//! Paper finder: retrieve → dedupe → rerank → paper-level aggregation.
//!
//! Turns a decomposed query into a ranked list of paper aggregates, each
//! carrying a dense reference number, merged passage text and metadata. The
//! reference number is the identity that citation markers use for the rest
//! of the task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::cancel::{CancelToken, Interrupt};
use crate::config::{PaperFinderConfig, RetrievalConfig};
use crate::corpus::{IndexError, PaperIndex, PaperRecord, Passage, SnippetKind};
use crate::pipeline::decompose::DecomposedQuery;
use crate::rerank::Reranker;

// =============================================================================
// Types
// =============================================================================

/// A candidate passage with its rerank score in [0, 1].
#[derive(Debug, Clone)]
pub struct RerankedPassage {
    pub passage: Passage,
    pub rerank_score: f64,
}

/// Merged, deduplicated view of one paper's kept passages.
#[derive(Debug, Clone)]
pub struct PaperAggregate {
    /// Dense 1..N id assigned in descending aggregate-score order.
    pub reference_number: u32,
    pub corpus_id: String,
    pub record: PaperRecord,
    /// Kept passages, rerank score descending.
    pub passages: Vec<RerankedPassage>,
    /// Header plus kept passage texts in deterministic order.
    pub merged_text: String,
    /// Max of the kept passages' rerank scores.
    pub aggregate_score: f64,
    /// Short bracketed identity used in prompts,
    /// e.g. `[3 | Devlin et al. | 2019 | Citations: 85000]`.
    pub reference_string: String,
}

/// Result of the retrieval + rerank stage.
#[derive(Debug)]
pub struct FinderOutput {
    pub papers: Vec<PaperAggregate>,
    /// Degraded paths taken along the way, for the event trace.
    pub warnings: Vec<String>,
    /// Candidate passages after merge + dedup.
    pub n_retrieved: usize,
}

#[derive(Debug, Error)]
pub enum FinderError {
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(IndexError),
    #[error("metadata lookup failed: {0}")]
    Metadata(IndexError),
    #[error("interrupted")]
    Interrupted(Interrupt),
}

// =============================================================================
// Finder
// =============================================================================

pub struct PaperFinder {
    index: Arc<dyn PaperIndex>,
    reranker: Arc<dyn Reranker>,
    retrieval: RetrievalConfig,
    config: PaperFinderConfig,
}

impl PaperFinder {
    pub fn new(
        index: Arc<dyn PaperIndex>,
        reranker: Arc<dyn Reranker>,
        retrieval: RetrievalConfig,
        config: PaperFinderConfig,
    ) -> Self {
        Self {
            index,
            reranker,
            retrieval,
            config,
        }
    }

    /// Run the full retrieval pipeline for a decomposed query.
    pub async fn find(
        &self,
        query: &DecomposedQuery,
        cancel: &CancelToken,
    ) -> Result<FinderOutput, FinderError> {
        cancel.check().map_err(FinderError::Interrupted)?;
        let mut warnings = Vec::new();

        // Snippet and keyword search run in parallel over the two query forms.
        let snippet_fut = self.index.snippet_search(
            &query.rewritten_query,
            &query.filters,
            self.retrieval.n_retrieval,
        );
        let keyword_fut = async {
            if query.keyword_query.trim().is_empty() {
                Ok(Vec::new())
            } else {
                self.index
                    .keyword_search(
                        &query.keyword_query,
                        &query.filters,
                        self.retrieval.n_keyword_srch,
                    )
                    .await
            }
        };
        let (snippet_result, keyword_result) = tokio::join!(snippet_fut, keyword_fut);

        let snippets = snippet_result.map_err(FinderError::RetrievalUnavailable)?;
        let keyword_papers = match keyword_result {
            Ok(papers) => papers,
            Err(err) => {
                warn!(error = %err, "keyword search failed; continuing with snippets only");
                warnings.push(format!("keyword search failed: {err}"));
                Vec::new()
            }
        };

        cancel.check().map_err(FinderError::Interrupted)?;

        // Merge + dedupe by (corpus_id, offsets); snippet hits win ties.
        let mut seen: HashSet<(String, Option<usize>, Option<usize>)> = HashSet::new();
        let mut candidates: Vec<Passage> = Vec::new();
        let mut snippet_corpus_ids: HashSet<String> = HashSet::new();
        for passage in snippets {
            if seen.insert(passage.location_key()) {
                snippet_corpus_ids.insert(passage.corpus_id.clone());
                candidates.push(passage);
            }
        }

        // Keyword hits for papers the snippet search missed contribute a
        // synthetic abstract passage.
        let mut keyword_metadata: HashMap<String, PaperRecord> = HashMap::new();
        for record in keyword_papers {
            if snippet_corpus_ids.contains(&record.corpus_id) {
                continue;
            }
            let Some(abstract_text) = record.abstract_text.clone() else {
                continue;
            };
            let passage = Passage {
                corpus_id: record.corpus_id.clone(),
                text: abstract_text,
                section_title: Some("abstract".to_string()),
                kind: SnippetKind::Abstract,
                score: 0.0,
                char_start: None,
                char_end: None,
            };
            if seen.insert(passage.location_key()) {
                candidates.push(passage);
            }
            keyword_metadata.insert(record.corpus_id.clone(), record);
        }

        let n_retrieved = candidates.len();
        if candidates.is_empty() {
            return Ok(FinderOutput {
                papers: Vec::new(),
                warnings,
                n_retrieved,
            });
        }

        // Metadata for every unique corpus id not already covered by the
        // keyword results.
        let missing_ids: Vec<String> = candidates
            .iter()
            .map(|p| p.corpus_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|id| !keyword_metadata.contains_key(id))
            .collect();
        let mut metadata = if missing_ids.is_empty() {
            HashMap::new()
        } else {
            self.index
                .fetch_metadata(&missing_ids)
                .await
                .map_err(FinderError::Metadata)?
        };
        metadata.extend(keyword_metadata);

        cancel.check().map_err(FinderError::Interrupted)?;

        // Rerank all candidate texts; fall back to normalized retrieval
        // order when the reranker is down.
        let texts: Vec<String> = candidates
            .iter()
            .map(|p| match metadata.get(&p.corpus_id) {
                Some(record) => format!("{} {}", record.title, p.text),
                None => p.text.clone(),
            })
            .collect();

        let scores = match self.reranker.score(&query.rewritten_query, &texts, cancel).await {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                warn!(
                    got = scores.len(),
                    expected = candidates.len(),
                    "reranker score misalignment; using retrieval order"
                );
                warnings.push("reranker returned misaligned scores; using retrieval order".into());
                normalized_retrieval_scores(&candidates)
            }
            Err(crate::rerank::RerankError::Interrupted(reason)) => {
                return Err(FinderError::Interrupted(reason))
            }
            Err(err) => {
                warn!(error = %err, "reranker unavailable; using retrieval order");
                warnings.push(format!("reranker unavailable ({err}); using retrieval order"));
                normalized_retrieval_scores(&candidates)
            }
        };

        let reranked: Vec<RerankedPassage> = candidates
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| *score >= self.config.context_threshold)
            .map(|(passage, rerank_score)| RerankedPassage {
                passage,
                rerank_score,
            })
            .collect();

        let papers = self.aggregate(reranked, &metadata);
        Ok(FinderOutput {
            papers,
            warnings,
            n_retrieved,
        })
    }

    /// Group kept passages by paper, build merged texts and assign dense
    /// reference numbers in descending aggregate-score order.
    fn aggregate(
        &self,
        reranked: Vec<RerankedPassage>,
        metadata: &HashMap<String, PaperRecord>,
    ) -> Vec<PaperAggregate> {
        let mut by_paper: HashMap<String, Vec<RerankedPassage>> = HashMap::new();
        for rp in reranked {
            if !metadata.contains_key(&rp.passage.corpus_id) {
                // No metadata, no citation; the passage cannot be used.
                continue;
            }
            by_paper.entry(rp.passage.corpus_id.clone()).or_default().push(rp);
        }

        let mut papers: Vec<(String, Vec<RerankedPassage>, f64)> = by_paper
            .into_iter()
            .map(|(corpus_id, mut passages)| {
                passages.sort_by(|a, b| {
                    b.rerank_score
                        .partial_cmp(&a.rerank_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.passage.char_start.cmp(&b.passage.char_start))
                });
                passages.truncate(self.config.passages_per_paper);
                let aggregate = passages
                    .iter()
                    .map(|p| p.rerank_score)
                    .fold(f64::MIN, f64::max);
                (corpus_id, passages, aggregate)
            })
            .collect();

        papers.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        if self.config.n_rerank > 0 {
            papers.truncate(self.config.n_rerank);
        }

        papers
            .into_iter()
            .enumerate()
            .map(|(idx, (corpus_id, passages, aggregate_score))| {
                let reference_number = (idx + 1) as u32;
                let record = metadata
                    .get(&corpus_id)
                    .cloned()
                    .expect("metadata presence checked above");
                let merged_text = merge_paper_text(&record, &passages);
                let reference_string = format!(
                    "[{} | {} | {} | Citations: {}]",
                    reference_number,
                    record.ref_author_str(),
                    record.year.map(|y| y.to_string()).unwrap_or_else(|| "n.d.".into()),
                    record.citation_count,
                );
                PaperAggregate {
                    reference_number,
                    corpus_id,
                    record,
                    passages,
                    merged_text,
                    aggregate_score,
                    reference_string,
                }
            })
            .collect()
    }
}

/// Retrieval-order fallback scores, normalized into [0, 1].
fn normalized_retrieval_scores(candidates: &[Passage]) -> Vec<f64> {
    let min = candidates.iter().map(|p| p.score).fold(f64::MAX, f64::min);
    let max = candidates.iter().map(|p| p.score).fold(f64::MIN, f64::max);
    if max > min {
        candidates
            .iter()
            .map(|p| (p.score - min) / (max - min))
            .collect()
    } else {
        vec![1.0; candidates.len()]
    }
}

/// Deterministic merged text: metadata header, abstract, then kept body
/// passages grouped by section in document order, separated by `\n...\n`.
fn merge_paper_text(record: &PaperRecord, passages: &[RerankedPassage]) -> String {
    let authors = record
        .authors
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = format!(
        "# Title: {}\n# Venue: {}\n# Authors: {}\n",
        record.title,
        record.venue.as_deref().unwrap_or(""),
        authors,
    );

    let abstract_text = record.abstract_text.clone().or_else(|| {
        passages
            .iter()
            .find(|p| p.passage.kind == SnippetKind::Abstract)
            .map(|p| p.passage.text.clone())
    });
    if let Some(abstract_text) = abstract_text {
        out.push_str("## Abstract\n");
        out.push_str(&abstract_text);
        out.push('\n');
    }

    // Body passages in document order, grouped under their section heading.
    let mut body: Vec<&RerankedPassage> = passages
        .iter()
        .filter(|p| !matches!(p.passage.kind, SnippetKind::Abstract | SnippetKind::Title))
        .collect();
    body.sort_by(|a, b| {
        a.passage
            .char_start
            .cmp(&b.passage.char_start)
            .then_with(|| a.passage.text.cmp(&b.passage.text))
    });

    let mut current_section: Option<&str> = None;
    for rp in body {
        let section = rp.passage.section_title.as_deref().unwrap_or("body");
        if current_section != Some(section) {
            out.push_str(&format!("\n## {section}\n"));
            current_section = Some(section);
        } else {
            out.push_str("\n...\n");
        }
        out.push_str(&rp.passage.text);
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Author;

    fn passage(corpus_id: &str, text: &str, start: usize, score: f64) -> RerankedPassage {
        RerankedPassage {
            passage: Passage {
                corpus_id: corpus_id.into(),
                text: text.into(),
                section_title: Some("Methods".into()),
                kind: SnippetKind::Body,
                score: 0.0,
                char_start: Some(start),
                char_end: Some(start + text.len()),
            },
            rerank_score: score,
        }
    }

    fn record(corpus_id: &str) -> PaperRecord {
        PaperRecord {
            corpus_id: corpus_id.into(),
            title: "A Paper".into(),
            authors: vec![Author {
                name: "Kim".into(),
                author_id: None,
            }],
            year: Some(2021),
            venue: Some("ACL".into()),
            citation_count: 12,
            influential_citation_count: 3,
            open_access: Some(true),
            abstract_text: Some("The abstract.".into()),
        }
    }

    #[test]
    fn merged_text_contains_passages_verbatim() {
        let passages = vec![
            passage("1", "second passage text here", 500, 0.7),
            passage("1", "first passage text here", 10, 0.9),
        ];
        let merged = merge_paper_text(&record("1"), &passages);
        assert!(merged.contains("first passage text here"));
        assert!(merged.contains("second passage text here"));
        assert!(merged.contains("## Abstract"));
        // Document order: the earlier offset comes first.
        let first = merged.find("first passage").unwrap();
        let second = merged.find("second passage").unwrap();
        assert!(first < second);
    }

    #[test]
    fn normalized_scores_span_unit_interval() {
        let candidates = vec![
            Passage {
                corpus_id: "1".into(),
                text: "a".into(),
                section_title: None,
                kind: SnippetKind::Body,
                score: 2.0,
                char_start: None,
                char_end: None,
            },
            Passage {
                corpus_id: "2".into(),
                text: "b".into(),
                section_title: None,
                kind: SnippetKind::Body,
                score: 6.0,
                char_start: None,
                char_end: None,
            },
        ];
        let scores = normalized_retrieval_scores(&candidates);
        assert_eq!(scores, vec![0.0, 1.0]);
    }
}
