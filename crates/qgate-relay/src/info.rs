use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use qgate_protocol::{claude, openai};

/// Outbound adapter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Anthropic,
    OpenAI,
    Vertex,
}

/// Inbound dialect discriminator. Most variants exist so logs and usage rows
/// can classify traffic; the relay pipeline itself branches only on the
/// request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    Chat,
    Completion,
    Embedding,
    Image,
    Audio,
    Rerank,
    Responses,
    ClaudeMessages,
    GeminiNative,
}

/// Thinking-variant request transformation parsed out of the model suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingVariant {
    /// No suffix; the request's own `thinking` block (if any) passes through.
    #[default]
    None,
    /// `-thinking`: synthesize a budget from the configured percentage.
    Auto,
    /// `-thinking-<budget>`: explicit budget from the suffix.
    Budget(u32),
    /// `-nothinking`: strip the suffix and never synthesize.
    Disabled,
}

/// Per-request context threaded through the pipeline.
///
/// Adapters receive `&mut RelayInfo` but may only write the fields the
/// pipeline treats as adapter-owned: `upstream_model_name`, `is_stream`
/// (promotion only, via [`RelayInfo::promote_stream`]), `prompt_tokens`, and
/// the override bag.
#[derive(Debug)]
pub struct RelayInfo {
    pub user_id: i64,
    pub key_id: i64,
    pub channel_id: i64,
    pub api_type: ApiType,
    pub relay_mode: RelayMode,
    pub origin_model_name: String,
    pub upstream_model_name: String,
    pub base_url: String,
    /// Opaque credential material; adapters interpret it (plain key, JSON
    /// service account, ...).
    pub api_key: String,
    pub api_version: Option<String>,
    is_stream: bool,
    pub prompt_tokens: u64,
    pub group: String,
    pub thinking: ThinkingVariant,
    /// Adapter-specific overrides (e.g. `request_model` after a vendor
    /// remap), surfaced to logging and usage rows.
    pub overrides: HashMap<String, String>,
    pub trace_id: String,
    pub started_at: Instant,
}

impl RelayInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: i64,
        key_id: i64,
        channel_id: i64,
        api_type: ApiType,
        relay_mode: RelayMode,
        origin_model_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        let origin_model_name = origin_model_name.into();
        Self {
            user_id,
            key_id,
            channel_id,
            api_type,
            relay_mode,
            upstream_model_name: origin_model_name.clone(),
            origin_model_name,
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_version: None,
            is_stream: false,
            prompt_tokens: 0,
            group: "default".to_string(),
            thinking: ThinkingVariant::None,
            overrides: HashMap::new(),
            trace_id: trace_id.into(),
            started_at: Instant::now(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.is_stream
    }

    /// `is_stream` is monotonic: it may flip false→true (client asked, or the
    /// upstream proved to be an event stream), never the reverse.
    pub fn promote_stream(&mut self) {
        self.is_stream = true;
    }

    pub fn set_override(&mut self, key: &str, value: impl Into<String>) {
        self.overrides.insert(key.to_string(), value.into());
    }

    pub fn get_override(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }
}

/// Inbound request, a sum over the dialects the gateway accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRequest {
    ClaudeMessages(claude::MessagesRequest),
    ChatCompletions(openai::ChatRequest),
}

impl InboundRequest {
    pub fn model(&self) -> &str {
        match self {
            InboundRequest::ClaudeMessages(request) => &request.model,
            InboundRequest::ChatCompletions(request) => &request.model,
        }
    }

    pub fn message_count(&self) -> usize {
        match self {
            InboundRequest::ClaudeMessages(request) => request.messages.len(),
            InboundRequest::ChatCompletions(request) => request.messages.len(),
        }
    }

    pub fn wants_stream(&self) -> bool {
        match self {
            InboundRequest::ClaudeMessages(request) => request.is_stream(),
            InboundRequest::ChatCompletions(request) => request.is_stream(),
        }
    }

    /// The completion-token ceiling used for pre-consumption pricing.
    pub fn max_completion_tokens(&self) -> u32 {
        match self {
            InboundRequest::ClaudeMessages(request) => request.max_tokens,
            InboundRequest::ChatCompletions(request) => request.completion_limit().unwrap_or(0),
        }
    }

    pub fn relay_mode(&self) -> RelayMode {
        match self {
            InboundRequest::ClaudeMessages(_) => RelayMode::ClaudeMessages,
            InboundRequest::ChatCompletions(_) => RelayMode::Chat,
        }
    }
}
