//! Section synthesis: ordered, context-carrying model calls that produce
//! each section's prose with inline citation markers.
//!
//! Sections are generated strictly in outline order because each call sees
//! the text written so far. The driver consumes one section at a time via
//! [`SectionWriter`] so table building for earlier list sections can overlap
//! with synthesis of later ones.

use std::collections::BTreeSet;

use tracing::warn;

use crate::cancel::CancelToken;
use crate::citation::{cited_references, scrub_markers, strip_unresolved};
use crate::gateway::Attribution;
use crate::llm::{CallOptions, Completion, ModelClient, ModelError, ModelLadder};
use crate::pipeline::extract::QuoteSet;
use crate::pipeline::outline::{Outline, SectionFormat, SectionPlan};
use crate::prompts::{SECTION_NO_QUOTES_PROMPT, SECTION_SYNTHESIS_PROMPT};

/// Deterministic fallback body for a failed section.
pub const SECTION_FALLBACK_TEXT: &str = "This section could not be generated.";

/// A synthesized section before citations are resolved into paper records.
#[derive(Debug, Clone)]
pub struct SectionDraft {
    pub name: String,
    pub format: SectionFormat,
    pub tldr: Option<String>,
    pub text: String,
    /// Reference numbers cited in `text`, ascending.
    pub cited: BTreeSet<u32>,
    /// True when this section fell back to the deterministic stub.
    pub degraded: bool,
}

/// Sequential writer over an outline, carrying prior-section context.
pub struct SectionWriter<'a> {
    client: &'a ModelClient,
    models: &'a ModelLadder,
    query: &'a str,
    quote_sets: &'a [QuoteSet],
    plan_listing: String,
    prior_text: String,
    prior_context_chars: usize,
    attribution: Attribution,
    pub warnings: Vec<String>,
    pub completions: Vec<Completion>,
}

impl<'a> SectionWriter<'a> {
    pub fn new(
        client: &'a ModelClient,
        models: &'a ModelLadder,
        query: &'a str,
        outline: &Outline,
        quote_sets: &'a [QuoteSet],
        prior_context_chars: usize,
        attribution: Attribution,
    ) -> Self {
        let plan_listing = outline
            .sections
            .iter()
            .map(|s| format!("- {}\n", s.name))
            .collect();
        Self {
            client,
            models,
            query,
            quote_sets,
            plan_listing,
            prior_text: String::new(),
            prior_context_chars,
            attribution,
            warnings: Vec::new(),
            completions: Vec::new(),
        }
    }

    /// Generate the next section of the outline.
    ///
    /// A section failure degrades to a deterministic fallback and does not
    /// abort the task; only an interruption propagates. Citation markers
    /// that do not resolve to a reference number among the section's
    /// assigned quotes are stripped with a warning.
    pub async fn write_section(
        &mut self,
        plan: &SectionPlan,
        cancel: &CancelToken,
    ) -> Result<SectionDraft, ModelError> {
        cancel.check().map_err(ModelError::Interrupted)?;

        let quotes_listing = section_quotes(plan, self.quote_sets);
        let allowed: BTreeSet<u32> = plan.quotes.iter().map(|h| h.reference_number).collect();

        let context = tail_chars(&self.prior_text, self.prior_context_chars);
        let format_str = match plan.format {
            SectionFormat::Synthesis => "synthesis",
            SectionFormat::List => "list",
        };
        let user_text = format!(
            "## Question\n{}\n\n## Outline\n{}\n## Already written\n{context}\n\n\
             ## Section to write now\n{} ({format_str})\n\n## Quotes\n{quotes_listing}",
            self.query, self.plan_listing, plan.name
        );
        let system = if quotes_listing.is_empty() {
            SECTION_NO_QUOTES_PROMPT
        } else {
            SECTION_SYNTHESIS_PROMPT
        };

        let opts = CallOptions {
            temperature: 0.3,
            max_output_tokens: 4096,
            ..Default::default()
        };

        match self
            .client
            .complete(
                self.models,
                system,
                &user_text,
                &opts,
                self.attribution.clone(),
                cancel,
            )
            .await
        {
            Ok(completion) => {
                let (tldr, body) = split_tldr(&completion.content);
                let (body, stripped) = strip_unresolved(&body, &allowed);
                if !stripped.is_empty() {
                    self.warnings.push(format!(
                        "section '{}': stripped unresolved citation markers {:?}",
                        plan.name, stripped
                    ));
                }
                let cited = cited_references(&body);

                // Later sections see the prose without its markers.
                self.prior_text.push_str(&scrub_markers(&body));
                self.prior_text.push_str("\n\n");

                self.completions.push(completion);
                Ok(SectionDraft {
                    name: plan.name.clone(),
                    format: plan.format,
                    tldr,
                    text: body,
                    cited,
                    degraded: false,
                })
            }
            Err(ModelError::Interrupted(reason)) => Err(ModelError::Interrupted(reason)),
            Err(err) => {
                warn!(section = %plan.name, error = %err, "section synthesis failed");
                self.warnings.push(format!(
                    "section '{}' could not be generated ({err})",
                    plan.name
                ));
                Ok(SectionDraft {
                    name: plan.name.clone(),
                    format: plan.format,
                    tldr: None,
                    text: SECTION_FALLBACK_TEXT.to_string(),
                    cited: BTreeSet::new(),
                    degraded: true,
                })
            }
        }
    }
}

/// The quotes assigned to a section, each tagged with its paper's reference
/// string.
fn section_quotes(plan: &SectionPlan, quote_sets: &[QuoteSet]) -> String {
    let mut listing = String::new();
    for handle in &plan.quotes {
        let Some(set) = quote_sets
            .iter()
            .find(|qs| qs.reference_number == handle.reference_number)
        else {
            continue;
        };
        let Some(quote) = set.quotes.get(handle.quote_index) else {
            continue;
        };
        listing.push_str(&format!("{}: {}\n", set.reference_string, quote.text));
    }
    listing
}

/// Split the required "TLDR: ..." first line off the section body.
fn split_tldr(content: &str) -> (Option<String>, String) {
    let trimmed = content.trim_start();
    if let Some(rest) = trimmed.strip_prefix("TLDR:") {
        let mut lines = rest.splitn(2, '\n');
        let tldr = lines.next().unwrap_or("").trim().to_string();
        let body = lines.next().unwrap_or("").trim().to_string();
        let tldr = if tldr.is_empty() { None } else { Some(tldr) };
        (tldr, body)
    } else {
        (None, trimmed.trim().to_string())
    }
}

/// Last `max_chars` characters of `text`, on a char boundary.
fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let (idx, _) = text.char_indices().nth(skip).expect("skip < char count");
    &text[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tldr_extracts_first_line() {
        let (tldr, body) = split_tldr("TLDR: Short answer.\nThe longer body [1].");
        assert_eq!(tldr.as_deref(), Some("Short answer."));
        assert_eq!(body, "The longer body [1].");
    }

    #[test]
    fn split_tldr_absent_prefix() {
        let (tldr, body) = split_tldr("Just a body.");
        assert!(tldr.is_none());
        assert_eq!(body, "Just a body.");
    }

    #[test]
    fn tail_chars_bounds_context() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 10), "ab");
    }
}
