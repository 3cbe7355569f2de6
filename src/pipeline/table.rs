//! Table building for list-formatted sections.
//!
//! Three sub-steps, each degrading gracefully: propose columns, fill one
//! cell per (paper, column) pair from the paper's abstract, then normalize
//! each column's values. A failed proposal means no table; a failed cell is
//! "N/A"; a failed normalization keeps the raw values. The section itself is
//! emitted either way.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::TableConfig;
use crate::gateway::Attribution;
use crate::llm::{CallOptions, Completion, ModelClient, ModelError, ModelLadder};
use crate::paper_finder::PaperAggregate;
use crate::prompts::{TABLE_CELL_PROMPT, TABLE_COLUMN_PROMPT, TABLE_NORMALIZE_PROMPT};
use crate::state::{TableCell, TableColumn, TableRow, TableWidget};

const NOT_AVAILABLE: &str = "N/A";

/// Cell phrases are capped at this many words.
const MAX_CELL_WORDS: usize = 10;

#[derive(Debug)]
pub struct TableOutput {
    pub table: Option<TableWidget>,
    pub warnings: Vec<String>,
    pub completions: Vec<Completion>,
}

#[derive(Debug, Deserialize)]
struct ColumnsJson {
    #[serde(default)]
    columns: Vec<ColumnJson>,
}

#[derive(Debug, Deserialize)]
struct ColumnJson {
    name: Option<String>,
    #[serde(default)]
    definition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CellJson {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NormalizeJson {
    #[serde(default)]
    values: Vec<String>,
}

/// Build a comparison table over `papers` for one list section.
#[allow(clippy::too_many_arguments)]
pub async fn build_table(
    client: &ModelClient,
    models: &ModelLadder,
    query: &str,
    section_title: &str,
    papers: &[&PaperAggregate],
    config: &TableConfig,
    max_workers: usize,
    attribution: Attribution,
    cancel: &CancelToken,
) -> Result<TableOutput, ModelError> {
    let mut warnings = Vec::new();
    let mut completions = Vec::new();

    if papers.len() < config.min_rows {
        return Ok(TableOutput {
            table: None,
            warnings,
            completions,
        });
    }
    let papers: Vec<&PaperAggregate> = papers.iter().copied().take(config.max_rows).collect();

    // --- Step 1: column proposal ---
    let paper_listing: String = papers
        .iter()
        .map(|p| {
            format!(
                "{}: {}\n{}\n",
                p.reference_string,
                p.record.title,
                p.record.abstract_text.as_deref().unwrap_or(""),
            )
        })
        .collect();
    let column_user = format!(
        "## Section\n{section_title}\n\n## Question\n{query}\n\n## Papers\n{paper_listing}"
    );
    let opts = CallOptions {
        max_output_tokens: 1024,
        ..Default::default()
    };

    let columns = match client
        .complete_structured::<ColumnsJson>(
            models,
            TABLE_COLUMN_PROMPT,
            &column_user,
            &opts,
            attribution.clone(),
            cancel,
        )
        .await
    {
        Ok((parsed, completion)) => {
            completions.push(completion);
            parsed
                .columns
                .into_iter()
                .filter_map(|c| {
                    let name = c.name.filter(|n| !n.trim().is_empty())?;
                    Some(TableColumn {
                        id: Uuid::new_v4().to_string(),
                        // Underscored names read poorly in clients.
                        name: name.replace('_', " "),
                        description: c.definition.unwrap_or_default(),
                    })
                })
                .take(config.max_columns)
                .collect::<Vec<_>>()
        }
        Err(ModelError::Interrupted(reason)) => return Err(ModelError::Interrupted(reason)),
        Err(err) => {
            warn!(section = section_title, error = %err, "column proposal failed; no table");
            warnings.push(format!(
                "table for '{section_title}' skipped: column proposal failed ({err})"
            ));
            return Ok(TableOutput {
                table: None,
                warnings,
                completions,
            });
        }
    };

    if columns.is_empty() {
        warnings.push(format!("table for '{section_title}' skipped: no columns proposed"));
        return Ok(TableOutput {
            table: None,
            warnings,
            completions,
        });
    }

    // --- Step 2: rows + bounded cell fan-out ---
    let rows: Vec<TableRow> = papers
        .iter()
        .map(|p| TableRow {
            id: Uuid::new_v4().to_string(),
            corpus_id: p.corpus_id.clone(),
            display_value: p.record.title.clone(),
        })
        .collect();

    let units: Vec<(usize, usize)> = (0..rows.len())
        .flat_map(|r| (0..columns.len()).map(move |c| (r, c)))
        .collect();

    let cell_results: Vec<((usize, usize), Option<(String, Completion)>)> =
        stream::iter(units.into_iter().map(|(r, c)| {
            let attribution = attribution.clone();
            let column = &columns[c];
            let paper = papers[r];
            async move {
                let user_text = format!(
                    "## Column\n{}: {}\n\n## Paper\n{}\n{}",
                    column.name,
                    column.description,
                    paper.record.title,
                    paper.record.abstract_text.as_deref().unwrap_or(""),
                );
                let opts = CallOptions {
                    max_output_tokens: 128,
                    ..Default::default()
                };
                let result = client
                    .complete_structured::<CellJson>(
                        models,
                        TABLE_CELL_PROMPT,
                        &user_text,
                        &opts,
                        attribution,
                        cancel,
                    )
                    .await;
                match result {
                    Ok((parsed, completion)) => {
                        let value = parsed
                            .value
                            .map(|v| clamp_cell_value(&v))
                            .filter(|v| !v.is_empty())
                            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
                        ((r, c), Some((value, completion)))
                    }
                    Err(err) => {
                        warn!(row = r, col = c, error = %err, "cell extraction failed");
                        ((r, c), None)
                    }
                }
            }
        }))
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await;

    cancel.check().map_err(ModelError::Interrupted)?;

    // Every (row, column) pair gets an entry; failures become "N/A".
    let mut values = vec![vec![NOT_AVAILABLE.to_string(); columns.len()]; rows.len()];
    let mut failed_cells = 0usize;
    for ((r, c), outcome) in cell_results {
        match outcome {
            Some((value, completion)) => {
                values[r][c] = value;
                completions.push(completion);
            }
            None => failed_cells += 1,
        }
    }
    if failed_cells > 0 {
        warnings.push(format!(
            "table for '{section_title}': {failed_cells} cells defaulted to {NOT_AVAILABLE}"
        ));
    }

    // --- Step 3: per-column normalization ---
    for (c, column) in columns.iter().enumerate() {
        cancel.check().map_err(ModelError::Interrupted)?;
        let raw: Vec<String> = (0..rows.len()).map(|r| values[r][c].clone()).collect();
        if raw.iter().all(|v| v == NOT_AVAILABLE) {
            continue;
        }
        let user_text = format!(
            "## Column\n{}: {}\n\n## Values\n{}",
            column.name,
            column.description,
            serde_json::to_string(&raw).unwrap_or_default(),
        );
        let opts = CallOptions {
            max_output_tokens: 512,
            ..Default::default()
        };
        match client
            .complete_structured::<NormalizeJson>(
                models,
                TABLE_NORMALIZE_PROMPT,
                &user_text,
                &opts,
                attribution.clone(),
                cancel,
            )
            .await
        {
            Ok((parsed, completion)) if parsed.values.len() == rows.len() => {
                completions.push(completion);
                for (r, value) in parsed.values.into_iter().enumerate() {
                    // Normalization must not resurrect missing cells.
                    if values[r][c] != NOT_AVAILABLE {
                        values[r][c] = clamp_cell_value(&value);
                    }
                }
            }
            Ok((parsed, completion)) => {
                completions.push(completion);
                warnings.push(format!(
                    "column '{}': normalization misaligned ({} values for {} rows); raw values kept",
                    column.name,
                    parsed.values.len(),
                    rows.len()
                ));
            }
            Err(ModelError::Interrupted(reason)) => return Err(ModelError::Interrupted(reason)),
            Err(err) => {
                warnings.push(format!(
                    "column '{}': normalization failed ({err}); raw values kept",
                    column.name
                ));
            }
        }
    }

    let mut cells = std::collections::BTreeMap::new();
    for (r, row) in rows.iter().enumerate() {
        for (c, column) in columns.iter().enumerate() {
            cells.insert(
                TableWidget::cell_key(&row.id, &column.id),
                TableCell {
                    display_value: values[r][c].clone(),
                    evidence: None,
                },
            );
        }
    }

    Ok(TableOutput {
        table: Some(TableWidget {
            columns,
            rows,
            cells,
        }),
        warnings,
        completions,
    })
}

/// Enforce the short-phrase contract on a cell value.
fn clamp_cell_value(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
        return NOT_AVAILABLE.to_string();
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.len() > MAX_CELL_WORDS {
        words[..MAX_CELL_WORDS].join(" ")
    } else {
        words.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_normalizes_na() {
        assert_eq!(clamp_cell_value("n/a"), "N/A");
        assert_eq!(clamp_cell_value("  "), "N/A");
    }

    #[test]
    fn clamp_truncates_long_phrases() {
        let long = "one two three four five six seven eight nine ten eleven twelve";
        assert_eq!(
            clamp_cell_value(long),
            "one two three four five six seven eight nine ten"
        );
    }
}
