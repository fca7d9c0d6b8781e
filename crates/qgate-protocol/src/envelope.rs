//! The `{ "error": { ... } }` envelope shared (loosely) by OpenAI, Anthropic
//! and Google error responses.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub error: ErrorBody,
    /// Some backends put the message at the top level instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// String for OpenAI, integer for Google; kept raw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<JsonValue>,
}

impl ErrorEnvelope {
    /// Best-effort human message when the canonical `error.message` is empty.
    pub fn fallback_message(&self) -> String {
        if !self.error.message.is_empty() {
            return self.error.message.clone();
        }
        if let Some(message) = self.message.as_deref() {
            if !message.is_empty() {
                return message.to_string();
            }
        }
        if let Some(detail) = self.detail.as_deref() {
            if !detail.is_empty() {
                return detail.to_string();
            }
        }
        String::new()
    }

    pub fn code_string(&self) -> Option<String> {
        match self.error.code.as_ref()? {
            JsonValue::String(value) => Some(value.clone()),
            JsonValue::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }
}
