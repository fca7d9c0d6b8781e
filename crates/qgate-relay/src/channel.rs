use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Deserialize;

use crate::info::ApiType;

/// A configured upstream account: credentials, base URL, model aliases and
/// per-channel overrides. Channels are loaded into a read-mostly snapshot;
/// the relay only ever reads them.
#[derive(Debug, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub api_type: ApiType,
    #[serde(default)]
    pub base_url: String,
    /// Opaque credential material handed to the adapter.
    pub api_key: String,
    #[serde(default)]
    pub api_version: Option<String>,
    /// Models this channel may serve (empty = any).
    #[serde(default)]
    pub models: Vec<String>,
    /// Channel-scoped model aliases, applied before anything else sees the
    /// model name.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Raw `{"<from>":"<to>"}` JSON; parsed lazily, once.
    #[serde(default)]
    pub status_code_mapping: String,
    /// Per-model `max_tokens` substituted for zero, overriding the global
    /// settings table.
    #[serde(default)]
    pub default_max_tokens: HashMap<String, u32>,
    #[serde(skip)]
    parsed_status_mapping: OnceLock<HashMap<u16, u16>>,
}

impl Channel {
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|candidate| candidate == model)
    }

    /// Apply the channel's alias table; unknown models pass through.
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    /// The parsed status-code remap table. Malformed JSON yields an empty
    /// table rather than failing requests.
    pub fn status_mapping(&self) -> &HashMap<u16, u16> {
        self.parsed_status_mapping.get_or_init(|| {
            let raw = self.status_code_mapping.trim();
            if raw.is_empty() || raw == "{}" {
                return HashMap::new();
            }
            let Ok(table) = serde_json::from_str::<HashMap<String, String>>(raw) else {
                return HashMap::new();
            };
            table
                .into_iter()
                .filter_map(|(from, to)| {
                    Some((from.parse::<u16>().ok()?, to.parse::<u16>().ok()?))
                })
                .collect()
        })
    }
}
