//! Per-token model prices in nanodollars (1e-9 USD).

/// Input and output price of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nanos: i64,
    pub output_nanos: i64,
}

impl ModelPricing {
    pub const fn new(input_nanos: i64, output_nanos: i64) -> Self {
        Self {
            input_nanos,
            output_nanos,
        }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        i64::from(input_tokens) * self.input_nanos + i64::from(output_tokens) * self.output_nanos
    }
}

/// Used for models missing from the table. Priced above the cheap tier so
/// budget projections for unknown models stay conservative.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(1_000, 5_000);

// Model id prefix, price. Dated snapshots ("...-20241022") match their base id.
// Checked against OpenRouter model pages, 2026-10.
const PRICE_TABLE: &[(&str, ModelPricing)] = &[
    ("anthropic/claude-3-5-haiku", ModelPricing::new(800, 4_000)),
    ("anthropic/claude-3-5-sonnet", ModelPricing::new(3_000, 15_000)),
    ("anthropic/claude-opus-4.5", ModelPricing::new(5_000, 25_000)),
    ("anthropic/claude-sonnet-4.5", ModelPricing::new(3_000, 15_000)),
    ("openai/gpt-4o-mini", ModelPricing::new(150, 600)),
    ("openai/gpt-5-mini", ModelPricing::new(250, 2_000)),
    ("openai/gpt-5.2-chat", ModelPricing::new(1_750, 14_000)),
    ("moonshotai/kimi-k2-0905", ModelPricing::new(390, 1_900)),
    ("google/gemini-2.5-flash", ModelPricing::new(300, 2_500)),
];

/// Price for `model_id`, matching exact ids and dated snapshots of a known id.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    PRICE_TABLE.iter().find_map(|(id, price)| {
        let snapshot = model_id
            .strip_prefix(id)
            .is_some_and(|rest| rest.is_empty() || is_date_suffix(rest));
        snapshot.then_some(*price)
    })
}

fn is_date_suffix(rest: &str) -> bool {
    let Some(digits) = rest.strip_prefix('-') else {
        return false;
    };
    let plain = digits.len() == 8 && digits.bytes().all(|b| b.is_ascii_digit());
    let dashed = digits.len() == 10
        && digits
            .bytes()
            .enumerate()
            .all(|(i, b)| if i == 4 || i == 7 { b == b'-' } else { b.is_ascii_digit() });
    plain || dashed
}

/// Cost of a finished call.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(DEFAULT_PRICING)
        .cost(input_tokens, output_tokens)
}

/// Worst-case cost of one call: the full prompt plus every allowed output token.
pub fn estimate_call_cost(model: &str, estimated_input_tokens: u32, max_output_tokens: u32) -> i64 {
    chat_cost(model, estimated_input_tokens, max_output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_cost() {
        // 1000 * 800 + 1000 * 4000
        assert_eq!(chat_cost("anthropic/claude-3-5-haiku", 1_000, 1_000), 4_800_000);
    }

    #[test]
    fn test_dated_snapshots_share_base_price() {
        let base = get_pricing("openai/gpt-4o-mini");
        assert!(base.is_some());
        assert_eq!(get_pricing("openai/gpt-4o-mini-2024-07-18"), base);
        assert_eq!(get_pricing("anthropic/claude-3-5-haiku-20241022"), get_pricing("anthropic/claude-3-5-haiku"));
        assert_eq!(get_pricing("openai/gpt-4o-mini-search"), None);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        assert_eq!(get_pricing("nobody/model"), None);
        assert_eq!(chat_cost("nobody/model", 10, 10), 10 * 1_000 + 10 * 5_000);
    }

    #[test]
    fn test_estimate_is_worst_case() {
        let est = estimate_call_cost("openai/gpt-4o-mini", 100, 4096);
        assert_eq!(est, 100 * 150 + 4096 * 600);
        assert!(est >= chat_cost("openai/gpt-4o-mini", 100, 50));
    }
}
