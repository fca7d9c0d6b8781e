//! Model-suffix opt-in to extended reasoning.
//!
//! `model-thinking`, `model-thinking-<budget>` and `model-nothinking` are
//! gateway-side conventions: the suffix never reaches the upstream, and for
//! the enabled variants a `thinking` block is synthesized when the client
//! did not send one.

use qgate_protocol::claude::{MessagesRequest, ThinkingConfig};

use crate::info::ThinkingVariant;

/// The provider rejects thinking budgets below this.
const MIN_BUDGET_TOKENS: u32 = 1024;
/// Budget must fit under max_tokens, so max_tokens gets floored alongside.
const MIN_MAX_TOKENS: u32 = 1280;

/// Split a model name into its upstream form and the thinking variant the
/// suffix selects. Unknown names pass through unchanged.
pub fn parse_thinking_suffix(model: &str) -> (&str, ThinkingVariant) {
    if let Some(stripped) = model.strip_suffix("-nothinking") {
        return (stripped, ThinkingVariant::Disabled);
    }
    if let Some(stripped) = model.strip_suffix("-thinking") {
        return (stripped, ThinkingVariant::Auto);
    }
    if let Some(position) = model.find("-thinking-") {
        let (base, rest) = model.split_at(position);
        let budget = rest["-thinking-".len()..].parse::<u32>().ok();
        return match budget {
            Some(budget) => (base, ThinkingVariant::Budget(budget)),
            None => (base, ThinkingVariant::Auto),
        };
    }
    (model, ThinkingVariant::None)
}

/// Apply the thinking-variant mutations to a Claude-dialect request.
///
/// Only fires when the variant enables thinking and the client did not send
/// its own `thinking` block, which also makes re-application a no-op. The
/// upstream documents extended thinking as incompatible with sampling
/// controls, hence the temperature pin and `top_p` clear.
pub fn apply_thinking_transform(
    request: &mut MessagesRequest,
    variant: ThinkingVariant,
    budget_percentage: f64,
) {
    let enabled = matches!(variant, ThinkingVariant::Auto | ThinkingVariant::Budget(_));
    if !enabled || request.thinking.is_some() {
        return;
    }

    if request.max_tokens < MIN_MAX_TOKENS {
        request.max_tokens = MIN_MAX_TOKENS;
    }
    let budget = match variant {
        ThinkingVariant::Budget(budget) => budget.max(MIN_BUDGET_TOKENS),
        _ => (request.max_tokens as f64 * budget_percentage).round() as u32,
    };
    request.thinking = Some(ThinkingConfig::enabled(budget));
    request.top_p = None;
    request.temperature = Some(1.0);
}
