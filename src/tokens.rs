//! Token counting for rate-limit estimation.
//!
//! Uses the cl100k BPE as a model-agnostic approximation. Overestimation is
//! fine: the rate limiter reconciles actual usage after each call.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static BPE: Lazy<CoreBPE> = Lazy::new(|| cl100k_base().expect("cl100k_base tokenizer"));

/// Count tokens in a text.
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_with_special_tokens(text).len()
}

/// Conservative input-token estimate for a (system, user) prompt pair.
///
/// Adds a small per-message overhead for role and formatting tokens.
pub fn estimate_prompt_tokens(system: &str, user: &str) -> u32 {
    let content = count_tokens(system) + count_tokens(user);
    (content + 16) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_positive_and_monotonic() {
        let short = count_tokens("reranker");
        let long = count_tokens("reranker models for scientific passage ranking");
        assert!(short >= 1);
        assert!(long > short);
    }

    #[test]
    fn estimate_includes_overhead() {
        let est = estimate_prompt_tokens("system", "user");
        assert!(est as usize > count_tokens("system") + count_tokens("user"));
    }
}
