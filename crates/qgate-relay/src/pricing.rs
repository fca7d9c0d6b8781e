use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::adapter::Usage;
use crate::error::RelayError;

/// Per-model ratios from the price table.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ModelPrice {
    pub model_ratio: f64,
    #[serde(default = "default_ratio")]
    pub completion_ratio: f64,
    #[serde(default = "default_ratio")]
    pub cache_ratio: f64,
}

fn default_ratio() -> f64 {
    1.0
}

/// Read-mostly price configuration. Admin changes build a new table and
/// publish it whole through [`PricingOracle::publish`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceTable {
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
    #[serde(default)]
    pub groups: HashMap<String, f64>,
}

/// Resolved pricing for one request.
#[derive(Debug, Clone, Copy)]
pub struct PriceData {
    /// Amount reserved before the upstream call.
    pub should_pre_consume_quota: i64,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub group_ratio: f64,
    pub cache_ratio: f64,
}

impl PriceData {
    /// Quota actually consumed by a measured usage. Cached input tokens are
    /// billed at the cache ratio instead of the full model ratio.
    pub fn quota_for_usage(&self, usage: &Usage) -> i64 {
        let cached = usage
            .cached_input_tokens
            .unwrap_or(0)
            .min(usage.prompt_tokens) as f64;
        let fresh = usage.prompt_tokens as f64 - cached;
        let completion = usage.completion_tokens as f64;
        let quota = fresh * self.model_ratio * self.group_ratio
            + cached * self.model_ratio * self.cache_ratio * self.group_ratio
            + completion * self.model_ratio * self.completion_ratio * self.group_ratio;
        quota as i64
    }
}

pub struct PricingOracle {
    table: ArcSwap<PriceTable>,
}

impl PricingOracle {
    pub fn new(table: PriceTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    pub fn publish(&self, table: PriceTable) {
        self.table.store(Arc::new(table));
    }

    /// Resolve ratios and the pre-consumption amount for one request.
    ///
    /// A missing group falls back to ratio 1; a missing model is an error
    /// because billing it would silently undercharge.
    pub fn price(
        &self,
        model: &str,
        group: &str,
        prompt_tokens: u64,
        max_completion_tokens: u32,
    ) -> Result<PriceData, RelayError> {
        let table = self.table.load();
        let price = table
            .models
            .get(model)
            .copied()
            .ok_or_else(|| RelayError::PriceFailed(format!("no price for model {model}")))?;
        let group_ratio = table.groups.get(group).copied().unwrap_or(1.0);

        let prompt = prompt_tokens as f64;
        let completion_cap = max_completion_tokens as f64;
        let should_pre_consume_quota = (prompt * price.model_ratio * group_ratio
            + completion_cap * price.model_ratio * price.completion_ratio * group_ratio)
            as i64;

        Ok(PriceData {
            should_pre_consume_quota,
            model_ratio: price.model_ratio,
            completion_ratio: price.completion_ratio,
            group_ratio,
            cache_ratio: price.cache_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle() -> PricingOracle {
        let mut table = PriceTable::default();
        table.models.insert(
            "claude-3-5-sonnet-20241022".to_string(),
            ModelPrice {
                model_ratio: 1.0,
                completion_ratio: 1.0,
                cache_ratio: 0.1,
            },
        );
        table.models.insert(
            "free-model".to_string(),
            ModelPrice {
                model_ratio: 0.0,
                completion_ratio: 1.0,
                cache_ratio: 1.0,
            },
        );
        table.groups.insert("default".to_string(), 1.0);
        table.groups.insert("vip".to_string(), 0.5);
        PricingOracle::new(table)
    }

    #[test]
    fn pre_consume_sums_prompt_and_completion_cap() {
        let price = oracle()
            .price("claude-3-5-sonnet-20241022", "default", 7, 4096)
            .unwrap();
        assert_eq!(price.should_pre_consume_quota, 4103);
    }

    #[test]
    fn group_ratio_scales_and_unknown_group_defaults() {
        let oracle = oracle();
        let vip = oracle
            .price("claude-3-5-sonnet-20241022", "vip", 100, 0)
            .unwrap();
        assert_eq!(vip.should_pre_consume_quota, 50);
        let unknown = oracle
            .price("claude-3-5-sonnet-20241022", "nope", 100, 0)
            .unwrap();
        assert_eq!(unknown.group_ratio, 1.0);
    }

    #[test]
    fn free_model_reserves_zero() {
        let price = oracle().price("free-model", "default", 1000, 4096).unwrap();
        assert_eq!(price.should_pre_consume_quota, 0);
    }

    #[test]
    fn unknown_model_is_an_error() {
        assert!(matches!(
            oracle().price("mystery", "default", 1, 1),
            Err(RelayError::PriceFailed(_))
        ));
    }

    #[test]
    fn usage_quota_discounts_cached_tokens() {
        let price = oracle()
            .price("claude-3-5-sonnet-20241022", "default", 100, 0)
            .unwrap();
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 10,
            total_tokens: 110,
            cached_input_tokens: Some(50),
            reasoning_tokens: None,
        };
        // 50 fresh + 50 × 0.1 cached + 10 completion
        assert_eq!(price.quota_for_usage(&usage), 65);
    }

    #[test]
    fn publish_swaps_the_table() {
        let oracle = oracle();
        let mut table = PriceTable::default();
        table.models.insert(
            "claude-3-5-sonnet-20241022".to_string(),
            ModelPrice {
                model_ratio: 2.0,
                completion_ratio: 1.0,
                cache_ratio: 1.0,
            },
        );
        oracle.publish(table);
        let price = oracle
            .price("claude-3-5-sonnet-20241022", "default", 10, 0)
            .unwrap();
        assert_eq!(price.should_pre_consume_quota, 20);
    }
}
