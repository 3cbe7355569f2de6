//! Model pricing registry.
//!
//! Centralized pricing data for the chat models the pipeline is configured
//! with. Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Provider name.
    pub provider: &'static str,
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(provider: &'static str, input: i64, output: i64) -> Self {
        Self {
            provider,
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// OpenRouter pricing (verify periodically against OpenRouter model pages)
// Claude 3.5 Haiku: $0.80/1M input, $4.00/1M output
// Claude 3.5 Sonnet: $3.00/1M input, $15.00/1M output
// GPT-4o: $2.50/1M input, $10.00/1M output
// GPT-4o-mini: $0.15/1M input, $0.60/1M output

const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new("openrouter", 800, 4_000);
const CLAUDE_35_SONNET: ModelPricing = ModelPricing::new("openrouter", 3_000, 15_000);
const GPT_4O: ModelPricing = ModelPricing::new("openrouter", 2_500, 10_000);
const GPT_4O_MINI: ModelPricing = ModelPricing::new("openrouter", 150, 600);
// GPT-5-mini: $0.25/1M input, $2.00/1M output
const GPT_5_MINI: ModelPricing = ModelPricing::new("openrouter", 250, 2_000);
// GPT-5.2 Chat: $1.75/1M input, $14.00/1M output
const GPT_5_2_CHAT: ModelPricing = ModelPricing::new("openrouter", 1_750, 14_000);
// Claude Opus 4.5: $5.00/1M input, $25.00/1M output
const CLAUDE_OPUS_4_5: ModelPricing = ModelPricing::new("openrouter", 5_000, 25_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("anthropic/claude-3-5-haiku", CLAUDE_35_HAIKU);
    map.insert("anthropic/claude-3-5-haiku-20241022", CLAUDE_35_HAIKU);
    map.insert("anthropic/claude-3-5-sonnet", CLAUDE_35_SONNET);
    map.insert("anthropic/claude-3-5-sonnet-20241022", CLAUDE_35_SONNET);
    map.insert("openai/gpt-4o", GPT_4O);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map.insert("openai/gpt-4o-mini-2024-07-18", GPT_4O_MINI);
    map.insert("openai/gpt-5-mini", GPT_5_MINI);
    map.insert("openai/gpt-5.2-chat", GPT_5_2_CHAT);
    map.insert("anthropic/claude-opus-4.5", CLAUDE_OPUS_4_5);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate chat cost.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    // Default to a mid-range model if unknown
    let default = ModelPricing::new("unknown", 1_000, 5_000);
    let pricing = get_pricing(model).unwrap_or(default);
    pricing.calculate_cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_cost() {
        // 1K input + 1K output for Claude 3.5 Haiku
        // Input: 1000 * 800 = 800,000 nanos
        // Output: 1000 * 4000 = 4,000,000 nanos
        let cost = chat_cost("anthropic/claude-3-5-haiku", 1_000, 1_000);
        assert_eq!(cost, 4_800_000);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let cost = chat_cost("nobody/mystery-model", 1_000, 0);
        assert_eq!(cost, 1_000_000);
    }
}
