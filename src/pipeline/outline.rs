//! Outline planning: one structured model call that clusters the extracted
//! quotes into named, typed sections.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::gateway::Attribution;
use crate::llm::{CallOptions, Completion, ModelClient, ModelError, ModelLadder};
use crate::pipeline::extract::QuoteSet;
use crate::prompts::OUTLINE_PROMPT;

/// How a section should be generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionFormat {
    Synthesis,
    List,
}

/// Pointer to one quote: (paper reference number, quote index within paper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuoteHandle {
    pub reference_number: u32,
    pub quote_index: usize,
}

/// One planned section.
#[derive(Debug, Clone, Serialize)]
pub struct SectionPlan {
    pub name: String,
    pub format: SectionFormat,
    pub quotes: Vec<QuoteHandle>,
}

/// The ordered outline.
#[derive(Debug, Clone, Serialize)]
pub struct Outline {
    pub sections: Vec<SectionPlan>,
    /// Planner's stated reasoning, kept for the trace.
    pub cot: String,
}

#[derive(Debug)]
pub struct OutlineOutput {
    pub outline: Outline,
    pub warnings: Vec<String>,
    pub completion: Option<Completion>,
}

#[derive(Debug, Deserialize)]
struct OutlineJson {
    #[serde(default)]
    cot: String,
    #[serde(default)]
    sections: Vec<OutlineSectionJson>,
}

#[derive(Debug, Deserialize)]
struct OutlineSectionJson {
    name: Option<String>,
    format: Option<String>,
    #[serde(default)]
    quotes: Vec<usize>,
}

/// Flatten quote sets into the numbered list shown to the planner, aligned
/// with the global ids it answers in.
fn flat_handles(quote_sets: &[QuoteSet]) -> (Vec<QuoteHandle>, String) {
    let mut handles = Vec::new();
    let mut listing = String::new();
    for set in quote_sets {
        for quote in &set.quotes {
            let global_id = handles.len();
            listing.push_str(&format!(
                "[{global_id}] (paper {}) {}\n",
                set.reference_number, quote.text
            ));
            handles.push(QuoteHandle {
                reference_number: set.reference_number,
                quote_index: quote.index,
            });
        }
    }
    (handles, listing)
}

/// The degraded one-section plan: everything under "Summary" in reference
/// order.
fn fallback_outline(handles: &[QuoteHandle]) -> Outline {
    Outline {
        sections: vec![SectionPlan {
            name: "Summary".to_string(),
            format: SectionFormat::Synthesis,
            quotes: handles.to_vec(),
        }],
        cot: String::new(),
    }
}

/// Plan the outline. Schema violations after retries degrade to a single
/// "Summary" section rather than failing the task.
pub async fn plan_outline(
    client: &ModelClient,
    models: &ModelLadder,
    query: &str,
    quote_sets: &[QuoteSet],
    attribution: Attribution,
    cancel: &CancelToken,
) -> Result<OutlineOutput, ModelError> {
    let (handles, listing) = flat_handles(quote_sets);
    let user_text = format!("## Question\n{query}\n\n## Quotes\n{listing}");

    let opts = CallOptions {
        max_output_tokens: 2048,
        ..Default::default()
    };

    let result = client
        .complete_structured::<OutlineJson>(
            models,
            OUTLINE_PROMPT,
            &user_text,
            &opts,
            attribution,
            cancel,
        )
        .await;

    let (parsed, completion) = match result {
        Ok(ok) => ok,
        Err(ModelError::SchemaViolation(err)) => {
            warn!(error = %err, "outline planning failed; degrading to single section");
            return Ok(OutlineOutput {
                outline: fallback_outline(&handles),
                warnings: vec![format!("outline planning degraded to one section ({err})")],
                completion: None,
            });
        }
        Err(other) => return Err(other),
    };

    let mut warnings = Vec::new();
    let mut seen_ids: HashSet<usize> = HashSet::new();
    let mut used_names: HashSet<String> = HashSet::new();
    let mut sections = Vec::new();

    for section in parsed.sections {
        let Some(name) = section.name.filter(|n| !n.trim().is_empty()) else {
            warnings.push("dropped unnamed outline section".into());
            continue;
        };
        let format = match section.format.as_deref() {
            Some("list") => SectionFormat::List,
            Some("synthesis") | None => SectionFormat::Synthesis,
            Some(other) => {
                warnings.push(format!(
                    "section '{name}': unknown format '{other}', using synthesis"
                ));
                SectionFormat::Synthesis
            }
        };

        let mut quotes = Vec::new();
        for id in section.quotes {
            match handles.get(id) {
                Some(handle) if seen_ids.insert(id) => quotes.push(*handle),
                Some(_) => {
                    warnings.push(format!("section '{name}': quote {id} already placed"));
                }
                None => {
                    warnings.push(format!("section '{name}': unknown quote id {id}"));
                }
            }
        }
        if quotes.is_empty() {
            warnings.push(format!("removed empty outline section '{name}'"));
            continue;
        }

        // Duplicate names are disambiguated by suffix.
        let mut final_name = name.trim().to_string();
        let mut suffix = 2;
        while !used_names.insert(final_name.clone()) {
            final_name = format!("{} ({suffix})", name.trim());
            suffix += 1;
        }

        sections.push(SectionPlan {
            name: final_name,
            format,
            quotes,
        });
    }

    // Quotes the planner never placed are dropped with a warning.
    let unplaced = handles.len() - seen_ids.len();
    if unplaced > 0 {
        warnings.push(format!("{unplaced} quotes not placed by the planner; dropped"));
    }

    let outline = if sections.is_empty() {
        warnings.push("planner produced no usable sections; degrading to one section".into());
        fallback_outline(&handles)
    } else {
        Outline {
            sections,
            cot: parsed.cot,
        }
    };

    Ok(OutlineOutput {
        outline,
        warnings,
        completion: Some(completion),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::Quote;

    fn quote_sets() -> Vec<QuoteSet> {
        vec![
            QuoteSet {
                reference_number: 1,
                corpus_id: "10".into(),
                reference_string: "[1 | A | 2020 | Citations: 5]".into(),
                quotes: vec![
                    Quote {
                        index: 0,
                        text: "first".into(),
                    },
                    Quote {
                        index: 1,
                        text: "second".into(),
                    },
                ],
            },
            QuoteSet {
                reference_number: 2,
                corpus_id: "20".into(),
                reference_string: "[2 | B | 2021 | Citations: 9]".into(),
                quotes: vec![Quote {
                    index: 0,
                    text: "third".into(),
                }],
            },
        ]
    }

    #[test]
    fn flat_handles_assigns_global_ids() {
        let sets = quote_sets();
        let (handles, listing) = flat_handles(&sets);
        assert_eq!(handles.len(), 3);
        assert_eq!(handles[2].reference_number, 2);
        assert_eq!(handles[2].quote_index, 0);
        assert!(listing.contains("[0] (paper 1) first"));
        assert!(listing.contains("[2] (paper 2) third"));
    }

    #[test]
    fn fallback_outline_keeps_reference_order() {
        let sets = quote_sets();
        let (handles, _) = flat_handles(&sets);
        let outline = fallback_outline(&handles);
        assert_eq!(outline.sections.len(), 1);
        assert_eq!(outline.sections[0].name, "Summary");
        assert_eq!(outline.sections[0].quotes.len(), 3);
        assert_eq!(outline.sections[0].format, SectionFormat::Synthesis);
    }
}
