//! Per-model cost table.
//!
//! Rates are USD per token as Decimal. Unknown models fall back to a
//! conservative default so usage is never silently free.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::BillingError;
use crate::model::Usage;

/// Per-token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRates {
    pub input: Decimal,
    pub output: Decimal,
    pub cache_write: Decimal,
    pub cache_read: Decimal,
}

/// Cost breakdown for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostBreakdown {
    pub input: Decimal,
    pub output: Decimal,
    pub cache_create: Decimal,
    pub cache_read: Decimal,
    pub total: Decimal,
    /// `total` with the group's rate multiplier applied; what balance
    /// billing and per-key quota actually move.
    pub actual: Decimal,
}

impl CostBreakdown {
    pub fn zero() -> Self {
        Self {
            input: Decimal::ZERO,
            output: Decimal::ZERO,
            cache_create: Decimal::ZERO,
            cache_read: Decimal::ZERO,
            total: Decimal::ZERO,
            actual: Decimal::ZERO,
        }
    }
}

/// Look up known per-token rates for a model by its identifier.
pub fn model_rates(model_id: &str) -> Option<ModelRates> {
    // Normalize: strip provider prefixes (e.g., "openai/gpt-5-codex").
    let id = model_id
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(model_id);

    match id {
        // OpenAI Codex / Responses models
        "gpt-5-codex" | "gpt-5.1-codex" | "gpt-5.2-codex" | "gpt-5.3-codex" => Some(ModelRates {
            input: dec!(0.00000125),
            output: dec!(0.00001),
            cache_write: dec!(0.00000125),
            cache_read: dec!(0.000000125),
        }),
        "gpt-5.1-codex-mini" | "gpt-5.3-codex-spark" => Some(ModelRates {
            input: dec!(0.00000025),
            output: dec!(0.000002),
            cache_write: dec!(0.00000025),
            cache_read: dec!(0.000000025),
        }),
        "o3" | "o4-mini" => Some(ModelRates {
            input: dec!(0.0000011),
            output: dec!(0.0000044),
            cache_write: dec!(0.0000011),
            cache_read: dec!(0.000000275),
        }),

        // Anthropic models (cache writes bill at 1.25x input)
        "claude-sonnet-4-5" | "claude-sonnet-4-20250514" => Some(ModelRates {
            input: dec!(0.000003),
            output: dec!(0.000015),
            cache_write: dec!(0.00000375),
            cache_read: dec!(0.0000003),
        }),
        "claude-opus-4-5" | "claude-opus-4-20250514" => Some(ModelRates {
            input: dec!(0.000015),
            output: dec!(0.000075),
            cache_write: dec!(0.00001875),
            cache_read: dec!(0.0000015),
        }),
        "claude-haiku-4-5" | "claude-3-5-haiku-latest" => Some(ModelRates {
            input: dec!(0.0000008),
            output: dec!(0.000004),
            cache_write: dec!(0.000001),
            cache_read: dec!(0.00000008),
        }),

        // Gemini models
        "gemini-2.5-pro" => Some(ModelRates {
            input: dec!(0.00000125),
            output: dec!(0.00001),
            cache_write: dec!(0.00000125),
            cache_read: dec!(0.00000031),
        }),
        "gemini-2.5-flash" => Some(ModelRates {
            input: dec!(0.0000003),
            output: dec!(0.0000025),
            cache_write: dec!(0.0000003),
            cache_read: dec!(0.000000075),
        }),

        _ => None,
    }
}

/// Default rates for unknown models. Roughly flagship-Codex pricing.
pub fn default_rates() -> ModelRates {
    ModelRates {
        input: dec!(0.00000125),
        output: dec!(0.00001),
        cache_write: dec!(0.00000125),
        cache_read: dec!(0.000000125),
    }
}

/// Compute the cost breakdown for observed usage.
///
/// Cache reads are billed at their own rate; the input line covers only
/// `usage.actual_input()` (input minus cache reads, floored at zero).
pub fn compute_cost(
    model: &str,
    usage: &Usage,
    multiplier: Decimal,
) -> Result<CostBreakdown, BillingError> {
    if multiplier < Decimal::ZERO {
        return Err(BillingError::CostCalculation {
            reason: format!("negative rate multiplier {multiplier}"),
        });
    }
    let rates = model_rates(model).unwrap_or_else(default_rates);

    let input = Decimal::from(usage.actual_input()) * rates.input;
    let output = Decimal::from(usage.output_tokens) * rates.output;
    let cache_create = Decimal::from(usage.cache_creation_tokens) * rates.cache_write;
    let cache_read = Decimal::from(usage.cache_read_tokens) * rates.cache_read;
    let total = input + output + cache_create + cache_read;

    Ok(CostBreakdown {
        input,
        output,
        cache_create,
        cache_read,
        total,
        actual: total * multiplier,
    })
}
