use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_STREAMING_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_THINKING_BUDGET_PERCENTAGE: f64 = 0.8;

/// Final, merged process-wide relay settings.
///
/// Published as an immutable snapshot; admin changes build a new value and
/// swap it in whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Whether model-name suffixes like `-thinking` opt requests into the
    /// provider's extended-reasoning mode.
    pub thinking_adapter_enabled: bool,
    /// Fraction of `max_tokens` granted as the synthesized thinking budget.
    pub thinking_adapter_budget_tokens_percentage: f64,
    /// Per-model `max_tokens` substituted when the client sends zero.
    #[serde(default)]
    pub default_max_tokens: HashMap<String, u32>,
    /// Upper bound on the total duration of a streaming upstream read.
    pub streaming_timeout_secs: u64,
    /// Accepted for config-file compatibility; the relay core ignores it.
    #[serde(default)]
    pub generate_default_token: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            thinking_adapter_enabled: true,
            thinking_adapter_budget_tokens_percentage: DEFAULT_THINKING_BUDGET_PERCENTAGE,
            default_max_tokens: HashMap::new(),
            streaming_timeout_secs: DEFAULT_STREAMING_TIMEOUT_SECS,
            generate_default_token: false,
        }
    }
}

impl RelaySettings {
    pub fn default_max_tokens_for(&self, model: &str) -> u32 {
        self.default_max_tokens
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let p = self.thinking_adapter_budget_tokens_percentage;
        if !(p > 0.0 && p < 1.0) {
            return Err(SettingsError::Invalid(
                "thinking_adapter_budget_tokens_percentage",
                format!("{p} is outside (0, 1)"),
            ));
        }
        if self.streaming_timeout_secs == 0 {
            return Err(SettingsError::Invalid(
                "streaming_timeout_secs",
                "must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Optional layer used when merging settings from several sources
/// (file < env < admin override).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelaySettingsPatch {
    pub thinking_adapter_enabled: Option<bool>,
    pub thinking_adapter_budget_tokens_percentage: Option<f64>,
    pub default_max_tokens: Option<HashMap<String, u32>>,
    pub streaming_timeout_secs: Option<u64>,
    pub generate_default_token: Option<bool>,
}

impl RelaySettingsPatch {
    pub fn apply_to(self, base: &mut RelaySettings) {
        if let Some(v) = self.thinking_adapter_enabled {
            base.thinking_adapter_enabled = v;
        }
        if let Some(v) = self.thinking_adapter_budget_tokens_percentage {
            base.thinking_adapter_budget_tokens_percentage = v;
        }
        if let Some(v) = self.default_max_tokens {
            base.default_max_tokens = v;
        }
        if let Some(v) = self.streaming_timeout_secs {
            base.streaming_timeout_secs = v;
        }
        if let Some(v) = self.generate_default_token {
            base.generate_default_token = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_tokens_falls_back() {
        let mut settings = RelaySettings::default();
        settings
            .default_max_tokens
            .insert("claude-3-5-haiku-20241022".to_string(), 8192);
        assert_eq!(
            settings.default_max_tokens_for("claude-3-5-haiku-20241022"),
            8192
        );
        assert_eq!(
            settings.default_max_tokens_for("claude-3-5-sonnet-20241022"),
            DEFAULT_MAX_TOKENS
        );
    }

    #[test]
    fn validate_rejects_budget_percentage_bounds() {
        let mut settings = RelaySettings::default();
        settings.thinking_adapter_budget_tokens_percentage = 1.0;
        assert!(settings.validate().is_err());
        settings.thinking_adapter_budget_tokens_percentage = 0.0;
        assert!(settings.validate().is_err());
        settings.thinking_adapter_budget_tokens_percentage = 0.5;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn patch_overlays_only_present_fields() {
        let mut settings = RelaySettings::default();
        let patch = RelaySettingsPatch {
            streaming_timeout_secs: Some(60),
            ..Default::default()
        };
        patch.apply_to(&mut settings);
        assert_eq!(settings.streaming_timeout_secs, 60);
        assert!(settings.thinking_adapter_enabled);
    }
}
