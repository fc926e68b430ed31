//! Static per-model price table.
//!
//! Step results report a single `tokens_used` figure, so each model carries one
//! blended price per million tokens rather than split input/output rates.

/// Rate used for models missing from the table, in USD per 1M tokens.
pub const FALLBACK_PRICE_PER_MILLION: f64 = 3.0;

/// Known models and their blended price in USD per 1M tokens.
const PRICE_TABLE: &[(&str, f64)] = &[
    ("claude-opus-4", 15.0),
    ("claude-3-opus", 15.0),
    ("claude-sonnet-4", 3.0),
    ("claude-3-5-sonnet", 3.0),
    ("claude-3-5-haiku", 0.8),
    ("claude-3-haiku", 0.25),
    ("gpt-4o-mini", 0.15),
    ("gpt-4o", 2.5),
    ("gpt-4-turbo", 10.0),
    ("gemini-2.5-pro", 1.25),
    ("gemini-2.5-flash", 0.3),
    ("gemini-2.0-flash", 0.1),
];

/// Normalize model names to canonical form for pricing lookup.
///
/// Strips a provider prefix (`anthropic/claude-sonnet-4` -> `claude-sonnet-4`)
/// and folds dated or dotted variants onto the table key.
pub fn normalize_model(model: &str) -> String {
    let trimmed = model.trim().to_lowercase();
    let base = trimmed.rsplit('/').next().unwrap_or(trimmed.as_str());

    let canonical = match base {
        s if s.contains("claude-opus-4") || s.contains("claude-4-opus") => "claude-opus-4",
        s if s.contains("claude-3-opus") => "claude-3-opus",
        s if s.contains("claude-sonnet-4") || s.contains("claude-4-sonnet") => "claude-sonnet-4",
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-3-haiku") => "claude-3-haiku",
        s if s.contains("gpt-4o-mini") => "gpt-4o-mini",
        s if s.contains("gpt-4o") => "gpt-4o",
        s if s.contains("gpt-4-turbo") => "gpt-4-turbo",
        s if s.contains("gemini-2.5-pro") || s.contains("gemini-2-5-pro") => "gemini-2.5-pro",
        s if s.contains("gemini-2.5-flash") || s.contains("gemini-2-5-flash") => "gemini-2.5-flash",
        s if s.contains("gemini-2.0-flash") || s.contains("gemini-2-0-flash") => "gemini-2.0-flash",
        s => s,
    };
    canonical.to_string()
}

/// Price per 1M tokens for a known model.
pub fn price_per_million(model: &str) -> Option<f64> {
    let normalized = normalize_model(model);
    PRICE_TABLE
        .iter()
        .find(|(id, _)| *id == normalized)
        .map(|(_, price)| *price)
}

/// Cost in USD of `tokens` on `model`, using the fallback rate for unknown
/// models.
///
/// # Formula
/// `cost = tokens / 1_000_000 * price_per_million(model)`
pub fn cost_for_tokens(tokens: u64, model: &str) -> f64 {
    let price = price_per_million(model).unwrap_or_else(|| {
        tracing::debug!(model = %model, "Unknown model, using fallback price");
        FALLBACK_PRICE_PER_MILLION
    });
    tokens as f64 / 1_000_000.0 * price
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("claude-3-5-sonnet-20241022"), "claude-3-5-sonnet");
        assert_eq!(normalize_model("claude-3.5-sonnet-latest"), "claude-3-5-sonnet");
        assert_eq!(normalize_model("anthropic/claude-sonnet-4"), "claude-sonnet-4");
        assert_eq!(normalize_model("gpt-4o-2024-08-06"), "gpt-4o");
        assert_eq!(normalize_model("GPT-4o-mini"), "gpt-4o-mini");
        assert_eq!(normalize_model("gemini-2.5-pro-preview"), "gemini-2.5-pro");
    }

    #[test]
    fn test_pricing_for_known_and_unknown_models() {
        assert_eq!(price_per_million("claude-sonnet-4"), Some(3.0));
        assert_eq!(price_per_million("openai/gpt-4o-mini"), Some(0.15));
        assert_eq!(price_per_million("unknown-model-xyz"), None);
    }

    #[test]
    fn test_cost_calculation() {
        assert!((cost_for_tokens(1_000_000, "claude-opus-4") - 15.0).abs() < 1e-9);
        assert!((cost_for_tokens(500_000, "claude-sonnet-4") - 1.5).abs() < 1e-9);
        assert_eq!(cost_for_tokens(0, "claude-sonnet-4"), 0.0);
        assert!(
            (cost_for_tokens(1_000_000, "mystery") - FALLBACK_PRICE_PER_MILLION).abs() < 1e-9
        );
    }
}
