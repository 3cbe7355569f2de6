//! Typed inline citation markers.
//!
//! A citation marker is a token `{reference_number}` rendered on the wire as
//! the short tag `[n]`. The core never produces HTML; clients render the
//! final presentation from these tags plus the section's citation list.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// An inline citation of reference number `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CitationMarker {
    pub reference: u32,
}

impl fmt::Display for CitationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.reference)
    }
}

static MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d{1,4})\]").expect("marker regex"));

/// All markers appearing in `text`, in order of appearance (with duplicates).
pub fn parse_markers(text: &str) -> Vec<CitationMarker> {
    MARKER_RE
        .captures_iter(text)
        .filter_map(|cap| cap[1].parse::<u32>().ok())
        .map(|reference| CitationMarker { reference })
        .collect()
}

/// Distinct reference numbers cited in `text`, ascending.
pub fn cited_references(text: &str) -> BTreeSet<u32> {
    parse_markers(text).into_iter().map(|m| m.reference).collect()
}

/// Remove markers whose reference is not in `allowed`.
///
/// Returns the cleaned text and the references that were stripped.
pub fn strip_unresolved(text: &str, allowed: &BTreeSet<u32>) -> (String, BTreeSet<u32>) {
    let mut stripped = BTreeSet::new();
    let cleaned = MARKER_RE.replace_all(text, |cap: &regex::Captures<'_>| {
        match cap[1].parse::<u32>() {
            Ok(reference) if allowed.contains(&reference) => cap[0].to_string(),
            Ok(reference) => {
                stripped.insert(reference);
                String::new()
            }
            Err(_) => cap[0].to_string(),
        }
    });
    // Collapse doubled spaces left behind by removed markers.
    let cleaned = cleaned.replace("  ", " ");
    (cleaned, stripped)
}

/// Remove all bracketed markers, used when scrubbing already-written section
/// text before it is carried as context into the next synthesis call.
pub fn scrub_markers(text: &str) -> String {
    MARKER_RE.replace_all(text, "").replace("  ", " ")
}
