use std::collections::HashMap;

use serde_json::json;

use qgate_protocol::envelope::ErrorEnvelope;

use crate::adapter::Usage;

const ERROR_BODY_SNIPPET_LIMIT: usize = 1000;

/// Everything the pipeline can fail with. Upstream error bodies are carried
/// verbatim so the handler can surface them to the client after the status
/// remap.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("model mapping failed: {0}")]
    ModelMappingFailed(String),
    #[error("token counting failed: {0}")]
    CountFailed(String),
    #[error("pricing failed: {0}")]
    PriceFailed(String),
    #[error("insufficient quota: need {needed}, balance {balance}")]
    QuotaInsufficient { needed: i64, balance: i64 },
    #[error("no adapter registered for api type")]
    InvalidApiType,
    #[error("request conversion failed: {0}")]
    ConvertFailed(String),
    #[error("{0}")]
    UpstreamTransport(String),
    #[error("{message}")]
    UpstreamStructured {
        status: u16,
        kind: Option<String>,
        code: Option<String>,
        message: String,
    },
    #[error("bad response status code {status}")]
    UpstreamOpaque {
        status: u16,
        detail: Option<String>,
    },
    #[error("response handling failed: {message}")]
    ResponseFailed {
        message: String,
        /// Usage the stream had reported before the failure, if any; billed
        /// instead of refunded when present.
        usage_so_far: Option<Usage>,
    },
}

impl RelayError {
    pub fn response_failed(message: impl Into<String>) -> Self {
        RelayError::ResponseFailed {
            message: message.into(),
            usage_so_far: None,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::ModelMappingFailed(_) => "model_mapping_failed",
            RelayError::CountFailed(_) => "count_token_failed",
            RelayError::PriceFailed(_) => "model_price_error",
            RelayError::QuotaInsufficient { .. } => "insufficient_user_quota",
            RelayError::InvalidApiType => "invalid_api_type",
            RelayError::ConvertFailed(_) => "convert_request_failed",
            RelayError::UpstreamTransport(_) => "do_request_failed",
            RelayError::UpstreamStructured { .. } => "upstream_error",
            RelayError::UpstreamOpaque { .. } => "bad_response_status_code",
            RelayError::ResponseFailed { .. } => "do_response_failed",
        }
    }

    /// True when the request never reached the upstream.
    pub fn is_local(&self) -> bool {
        !matches!(
            self,
            RelayError::UpstreamTransport(_)
                | RelayError::UpstreamStructured { .. }
                | RelayError::UpstreamOpaque { .. }
                | RelayError::ResponseFailed { .. }
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::InvalidRequest(_) | RelayError::ModelMappingFailed(_) => 400,
            RelayError::QuotaInsufficient { .. } => 403,
            RelayError::CountFailed(_)
            | RelayError::PriceFailed(_)
            | RelayError::InvalidApiType
            | RelayError::ConvertFailed(_)
            | RelayError::ResponseFailed { .. } => 500,
            RelayError::UpstreamTransport(_) => 502,
            RelayError::UpstreamStructured { status, .. }
            | RelayError::UpstreamOpaque { status, .. } => *status,
        }
    }

    /// Anthropic-dialect error body.
    pub fn to_claude_body(&self) -> serde_json::Value {
        let kind = match self {
            RelayError::UpstreamStructured { kind: Some(kind), .. } => kind.clone(),
            _ => self.code().to_string(),
        };
        json!({
            "type": "error",
            "error": { "type": kind, "message": self.to_string() }
        })
    }

    /// OpenAI-dialect error body.
    pub fn to_openai_body(&self) -> serde_json::Value {
        let kind = match self {
            RelayError::UpstreamStructured { kind: Some(kind), .. } => kind.clone(),
            _ => "relay_error".to_string(),
        };
        json!({
            "error": {
                "message": self.to_string(),
                "type": kind,
                "code": self.code(),
            }
        })
    }
}

/// Parse an upstream non-200 body into the uniform taxonomy.
///
/// There is a single normalized path: a body that cannot be read or parsed
/// becomes [`RelayError::UpstreamOpaque`] with the original status preserved
/// (optionally carrying a truncated snippet when `show_body` is set).
pub fn normalize_upstream_error(status: u16, body: &[u8], show_body: bool) -> RelayError {
    let envelope = match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope,
        Err(_) => {
            let detail = show_body.then(|| truncate_body(body));
            return RelayError::UpstreamOpaque { status, detail };
        }
    };
    let message = envelope.fallback_message();
    if message.is_empty() {
        let detail = show_body.then(|| truncate_body(body));
        return RelayError::UpstreamOpaque { status, detail };
    }
    RelayError::UpstreamStructured {
        status,
        kind: envelope.error.kind.clone(),
        code: envelope.code_string(),
        message,
    }
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() > ERROR_BODY_SNIPPET_LIMIT {
        let mut end = ERROR_BODY_SNIPPET_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &text[..end])
    } else {
        text.into_owned()
    }
}

/// Rewrite the error's status through the channel's remap table. 200 is never
/// rewritten, and a target code with no further mapping makes a second
/// application a no-op.
pub fn apply_status_code_remap(error: &mut RelayError, mapping: &HashMap<u16, u16>) {
    if mapping.is_empty() {
        return;
    }
    let status = match error {
        RelayError::UpstreamStructured { status, .. }
        | RelayError::UpstreamOpaque { status, .. } => status,
        _ => return,
    };
    if *status == 200 {
        return;
    }
    if let Some(mapped) = mapping.get(status) {
        *status = *mapped;
    }
}

/// Replace transport error text that leaks endpoint detail with a generic
/// message; the original is logged, never returned to clients.
pub fn scrub_transport_message(message: &str) -> String {
    let lowered = message.to_ascii_lowercase();
    let leaky = ["http", "dial", "dns", "tls", "connect", "url"];
    if leaky.iter().any(|needle| lowered.contains(needle)) {
        tracing::warn!(event = "transport_error_scrubbed", error = %message);
        return "failed to reach the upstream endpoint".to_string();
    }
    message.to_string()
}
