//! Per-task pipeline driver.
//!
//! Runs the stage sequence for one task: decompose → retrieve → extract →
//! plan → synthesize, with table building for list sections overlapping the
//! synthesis of later sections. Every stage appends a progress step with a
//! time estimate and writes a record into the event trace. Only fatal stage
//! failures escape; every degraded path is a warning.

pub mod decompose;
pub mod extract;
pub mod outline;
pub mod synthesize;
pub mod table;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::cancel::{CancelToken, Interrupt};
use crate::config::AppConfig;
use crate::gateway::Attribution;
use crate::llm::{Completion, ModelClient, ModelError, ModelLadder};
use crate::paper_finder::{FinderError, PaperAggregate, PaperFinder};
use crate::state::{
    Citation, CostRecord, GeneratedSection, ResultStore, TaskResult, TaskStep, TimingRecord,
};
use crate::trace::EventTrace;

use self::outline::SectionFormat;
use self::synthesize::SectionWriter;
use self::table::TableOutput;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    NoPapers(String),
    #[error("no relevant quotes could be extracted from the retrieved papers")]
    NoQuotes,
    #[error("retrieval unavailable: {0}")]
    Retrieval(String),
    #[error("model failure: {0}")]
    Model(String),
    #[error("interrupted")]
    Interrupted(Interrupt),
}

impl PipelineError {
    /// User-facing failure detail for the task state document.
    pub fn detail(&self) -> String {
        match self {
            Self::NoPapers(msg) => msg.clone(),
            Self::NoQuotes => self.to_string(),
            Self::Retrieval(_) => "The paper corpus is currently unavailable.".to_string(),
            Self::Model(_) => "Answer generation failed.".to_string(),
            Self::Interrupted(Interrupt::Cancelled) => "The task was cancelled.".to_string(),
            Self::Interrupted(Interrupt::DeadlineExceeded) => {
                "The task exceeded its timeout.".to_string()
            }
        }
    }
}

fn fatal(err: ModelError) -> PipelineError {
    match err {
        ModelError::Interrupted(reason) => PipelineError::Interrupted(reason),
        other => PipelineError::Model(other.to_string()),
    }
}

// =============================================================================
// Step time estimates
// =============================================================================

/// Input size classes for the step-estimate lookup.
#[derive(Debug, Clone, Copy)]
enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    fn of(size: usize) -> Self {
        if size < 8 {
            SizeClass::Small
        } else if size < 32 {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }
}

/// Estimated duration for a stage, keyed by stage name and input size class.
fn stage_estimate(stage: &str, size: usize) -> Duration {
    let secs = match (stage, SizeClass::of(size)) {
        ("decompose", _) => 5,
        ("retrieve", SizeClass::Small) => 5,
        ("retrieve", _) => 8,
        ("rerank", SizeClass::Small) => 5,
        ("rerank", SizeClass::Medium) => 10,
        ("rerank", SizeClass::Large) => 15,
        ("extract", SizeClass::Small) => 10,
        ("extract", SizeClass::Medium) => 15,
        ("extract", SizeClass::Large) => 25,
        ("plan", _) => 15,
        ("section", _) => 15,
        ("tables", _) => 20,
        _ => 10,
    };
    Duration::from_secs(secs)
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct QaPipeline {
    client: Arc<ModelClient>,
    finder: Arc<PaperFinder>,
    config: Arc<AppConfig>,
}

impl QaPipeline {
    pub fn new(client: Arc<ModelClient>, finder: Arc<PaperFinder>, config: Arc<AppConfig>) -> Self {
        Self {
            client,
            finder,
            config,
        }
    }

    fn main_ladder(&self) -> ModelLadder {
        ModelLadder::new(
            self.config.pipeline.llm.clone(),
            self.config.pipeline.fallback_llm.clone(),
        )
    }

    fn decomposer_ladder(&self) -> ModelLadder {
        ModelLadder::new(
            self.config.decomposer_model().to_string(),
            self.config.pipeline.fallback_llm.clone(),
        )
    }

    fn tables_ladder(&self) -> ModelLadder {
        ModelLadder::new(
            self.config.tables_model().to_string(),
            self.config.pipeline.fallback_llm.clone(),
        )
    }

    async fn step(
        &self,
        store: &Arc<dyn ResultStore>,
        task_id: &str,
        description: String,
        stage: &str,
        size: usize,
    ) {
        let step = TaskStep::new(description, stage_estimate(stage, size));
        if let Err(err) = store.append_step(task_id, step).await {
            warn!(task_id, error = %err, "failed to append step");
        }
    }

    /// Drive all stages for one task. The caller owns status transitions;
    /// this returns the result payload or the first fatal error.
    pub async fn run(
        &self,
        task_id: &str,
        user_id: Option<&str>,
        query: &str,
        store: &Arc<dyn ResultStore>,
        trace: &mut EventTrace,
        cancel: &CancelToken,
    ) -> Result<TaskResult, PipelineError> {
        let run_started = Utc::now();
        let mut completions: Vec<Completion> = Vec::new();

        let attribution = |caller: &'static str| {
            let mut a = Attribution::new(caller).with_task(task_id.to_string());
            if let Some(user_id) = user_id {
                a = a.with_user(user_id.to_string());
            }
            a
        };

        // --- Stage 0: decompose ---
        let started = Utc::now();
        self.step(
            store,
            task_id,
            "Analyzing the question and deriving search filters".into(),
            "decompose",
            0,
        )
        .await;
        let (decomposed, decompose_usage) = decompose::decompose_query(
            &self.client,
            &self.decomposer_ladder(),
            query,
            attribution("pipeline::decompose"),
            cancel,
        )
        .await
        .map_err(fatal)?;
        if decomposed.degraded {
            trace.add_warning("query decomposition degraded to the trivial form");
        }
        let decompose_cost = decompose_usage.as_ref().map(|c| c.cost_nanodollars).unwrap_or(0);
        completions.extend(decompose_usage);
        trace.record_stage(
            "decompose",
            started,
            decompose_cost,
            query,
            serde_json::to_value(&decomposed).unwrap_or_default(),
        );

        // --- Stage 1: retrieve + rerank + aggregate ---
        let started = Utc::now();
        self.step(
            store,
            task_id,
            "Retrieving relevant passages from the paper corpus".into(),
            "retrieve",
            self.config.retrieval.n_retrieval,
        )
        .await;
        let found = self
            .finder
            .find(&decomposed, cancel)
            .await
            .map_err(|err| match err {
                FinderError::Interrupted(reason) => PipelineError::Interrupted(reason),
                other => PipelineError::Retrieval(other.to_string()),
            })?;
        trace.add_warnings(found.warnings.clone());
        trace.record_stage(
            "retrieve",
            started,
            0,
            &decomposed.rewritten_query,
            serde_json::json!({
                "n_retrieved": found.n_retrieved,
                "n_papers": found.papers.len(),
                "papers": found
                    .papers
                    .iter()
                    .map(|p| serde_json::json!({
                        "reference_number": p.reference_number,
                        "corpus_id": p.corpus_id,
                        "aggregate_score": p.aggregate_score,
                    }))
                    .collect::<Vec<_>>(),
            }),
        );

        if found.n_retrieved == 0 {
            return Err(PipelineError::NoPapers(format!(
                "No relevant papers were found for the query: {query}"
            )));
        }
        if found.papers.is_empty() {
            return Err(PipelineError::NoPapers(
                "No papers remained after reranking; the query may be too narrow.".to_string(),
            ));
        }
        let papers = Arc::new(found.papers);
        self.step(
            store,
            task_id,
            format!(
                "Found {} highly relevant papers after re-ranking and aggregating",
                papers.len()
            ),
            "rerank",
            papers.len(),
        )
        .await;

        // --- Stage 2: evidence extraction ---
        let started = Utc::now();
        self.step(
            store,
            task_id,
            "Extracting salient key statements from the papers".into(),
            "extract",
            papers.len(),
        )
        .await;
        let extracted = extract::extract_quotes(
            &self.client,
            &self.main_ladder(),
            query,
            &papers,
            self.config.pipeline.max_llm_workers,
            attribution("pipeline::extract"),
            cancel,
        )
        .await
        .map_err(fatal)?;
        trace.add_warnings(extracted.warnings.clone());
        let extract_cost: i64 = extracted.completions.iter().map(|c| c.cost_nanodollars).sum();
        trace.record_stage(
            "extract",
            started,
            extract_cost,
            format!("{} papers", papers.len()),
            serde_json::json!({
                "papers_with_quotes": extracted.quote_sets.len(),
                "quotes": extracted
                    .quote_sets
                    .iter()
                    .map(|qs| serde_json::json!({
                        "reference_number": qs.reference_number,
                        "n_quotes": qs.quotes.len(),
                    }))
                    .collect::<Vec<_>>(),
            }),
        );
        completions.extend(extracted.completions);

        if extracted.quote_sets.is_empty() {
            return Err(PipelineError::NoQuotes);
        }

        // --- Stage 3: outline planning ---
        let started = Utc::now();
        self.step(
            store,
            task_id,
            "Synthesizing an answer outline based on the extracted quotes".into(),
            "plan",
            extracted.quote_sets.len(),
        )
        .await;
        let planned = outline::plan_outline(
            &self.client,
            &self.main_ladder(),
            query,
            &extracted.quote_sets,
            attribution("pipeline::outline"),
            cancel,
        )
        .await
        .map_err(fatal)?;
        trace.add_warnings(planned.warnings.clone());
        let plan_cost = planned.completion.as_ref().map(|c| c.cost_nanodollars).unwrap_or(0);
        completions.extend(planned.completion);
        trace.record_stage(
            "plan",
            started,
            plan_cost,
            format!(
                "{} quotes",
                extracted.quote_sets.iter().map(|q| q.quotes.len()).sum::<usize>()
            ),
            serde_json::to_value(&planned.outline).unwrap_or_default(),
        );
        let plan = planned.outline;

        // Whole-task estimate now that the section count is known.
        let task_secs = 30 + 15 * plan.sections.len() as u64;
        let task_minutes = (task_secs / 60).max(1);
        let estimate = if task_minutes > 1 {
            format!("~{task_minutes} minutes")
        } else {
            "~1 minute".to_string()
        };
        if let Err(err) = store.set_estimated_time(task_id, estimate).await {
            warn!(task_id, error = %err, "failed to update task estimate");
        }

        // --- Stage 4: synthesis, tables overlapping later sections ---
        let started = Utc::now();
        let main_ladder = self.main_ladder();
        let tables_ladder = self.tables_ladder();
        let mut writer = SectionWriter::new(
            &self.client,
            &main_ladder,
            query,
            &plan,
            &extracted.quote_sets,
            self.config.pipeline.prior_context_chars,
            attribution("pipeline::synthesize"),
        );

        let mut drafts = Vec::with_capacity(plan.sections.len());
        let mut table_tasks: Vec<(usize, tokio::task::JoinHandle<Result<TableOutput, ModelError>>)> =
            Vec::new();

        for (idx, section_plan) in plan.sections.iter().enumerate() {
            self.step(
                store,
                task_id,
                format!(
                    "Generating section {} of {}: {}",
                    idx + 1,
                    plan.sections.len(),
                    section_plan.name
                ),
                "section",
                1,
            )
            .await;
            let draft = writer.write_section(section_plan, cancel).await.map_err(fatal)?;

            // List sections with enough cited papers get a comparison table,
            // built concurrently with the remaining sections.
            if draft.format == SectionFormat::List
                && draft.cited.len() >= self.config.tables.min_rows
            {
                let client = Arc::clone(&self.client);
                let ladder = tables_ladder.clone();
                let query = query.to_string();
                let title = draft.name.clone();
                let cited: Vec<PaperAggregate> = papers
                    .iter()
                    .filter(|p| draft.cited.contains(&p.reference_number))
                    .cloned()
                    .collect();
                let table_config = self.config.tables.clone();
                let max_workers = self.config.pipeline.max_llm_workers;
                let attribution = attribution("pipeline::tables");
                let cancel = cancel.clone();
                table_tasks.push((
                    idx,
                    tokio::spawn(async move {
                        let refs: Vec<&PaperAggregate> = cited.iter().collect();
                        table::build_table(
                            &client,
                            &ladder,
                            &query,
                            &title,
                            &refs,
                            &table_config,
                            max_workers,
                            attribution,
                            &cancel,
                        )
                        .await
                    }),
                ));
            }

            drafts.push(draft);
        }

        let synth_cost: i64 = writer.completions.iter().map(|c| c.cost_nanodollars).sum();
        trace.add_warnings(writer.warnings.clone());
        completions.append(&mut writer.completions);
        trace.record_stage(
            "synthesize",
            started,
            synth_cost,
            format!("{} sections", plan.sections.len()),
            serde_json::json!({
                "sections": drafts
                    .iter()
                    .map(|d| serde_json::json!({
                        "name": d.name,
                        "degraded": d.degraded,
                        "n_citations": d.cited.len(),
                    }))
                    .collect::<Vec<_>>(),
            }),
        );

        // --- Stage 5: collect tables ---
        let mut tables: Vec<Option<crate::state::TableWidget>> = vec![None; drafts.len()];
        if !table_tasks.is_empty() {
            let started = Utc::now();
            self.step(
                store,
                task_id,
                "Generating comparison tables".into(),
                "tables",
                table_tasks.len(),
            )
            .await;
            let mut tables_cost = 0i64;
            let mut built = 0usize;
            for (idx, handle) in table_tasks {
                match handle.await {
                    Ok(Ok(output)) => {
                        trace.add_warnings(output.warnings);
                        tables_cost += output
                            .completions
                            .iter()
                            .map(|c| c.cost_nanodollars)
                            .sum::<i64>();
                        completions.extend(output.completions);
                        if output.table.is_some() {
                            built += 1;
                        }
                        tables[idx] = output.table;
                    }
                    Ok(Err(ModelError::Interrupted(reason))) => {
                        return Err(PipelineError::Interrupted(reason));
                    }
                    Ok(Err(err)) => {
                        trace.add_warning(format!("table generation failed: {err}"));
                    }
                    Err(err) => {
                        trace.add_warning(format!("table task panicked: {err}"));
                    }
                }
            }
            trace.record_stage(
                "tables",
                started,
                tables_cost,
                format!("{} list sections", tables.iter().flatten().count().max(built)),
                serde_json::json!({ "tables_built": built }),
            );
        }

        cancel.check().map_err(PipelineError::Interrupted)?;

        // --- Assemble the result ---
        let mut referenced: BTreeSet<u32> = BTreeSet::new();
        let sections: Vec<GeneratedSection> = drafts
            .into_iter()
            .zip(tables)
            .map(|(draft, table)| {
                let citations = draft
                    .cited
                    .iter()
                    .filter_map(|reference| {
                        referenced.insert(*reference);
                        papers
                            .iter()
                            .find(|p| p.reference_number == *reference)
                            .map(|p| Citation {
                                id: reference.to_string(),
                                paper: p.record.clone(),
                            })
                    })
                    .collect();
                GeneratedSection {
                    title: draft.name,
                    tldr: draft.tldr,
                    format: draft.format,
                    text: draft.text,
                    citations,
                    table,
                }
            })
            .collect();

        let references = papers
            .iter()
            .filter(|p| referenced.contains(&p.reference_number))
            .map(|p| p.record.clone())
            .collect();

        let finished = Utc::now();
        Ok(TaskResult {
            sections,
            references,
            cost: CostRecord::from_completions(&completions),
            timing: TimingRecord {
                started_at: Some(run_started),
                finished_at: Some(finished),
                total_ms: (finished - run_started).num_milliseconds().max(0) as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_partition_inputs() {
        assert!(matches!(SizeClass::of(0), SizeClass::Small));
        assert!(matches!(SizeClass::of(7), SizeClass::Small));
        assert!(matches!(SizeClass::of(8), SizeClass::Medium));
        assert!(matches!(SizeClass::of(31), SizeClass::Medium));
        assert!(matches!(SizeClass::of(32), SizeClass::Large));
    }

    #[test]
    fn estimates_scale_with_input() {
        assert!(stage_estimate("extract", 40) > stage_estimate("extract", 4));
        assert_eq!(stage_estimate("decompose", 0), Duration::from_secs(5));
    }
}
