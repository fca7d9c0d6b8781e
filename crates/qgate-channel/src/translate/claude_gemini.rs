//! Claude messages ↔ Gemini generateContent.

use serde_json::Value as JsonValue;

use qgate_protocol::claude;
use qgate_protocol::gemini;

/// Convert a Claude messages request into a Gemini generateContent body.
pub fn gemini_request_from_messages(
    request: &claude::MessagesRequest,
) -> gemini::GenerateContentRequest {
    let mut contents = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            claude::Role::User => "user",
            claude::Role::Assistant => "model",
        };
        let parts = match &message.content {
            claude::MessageContent::Text(text) => vec![gemini::Part {
                text: Some(text.clone()),
                inline_data: None,
            }],
            claude::MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| map_block(block))
                .collect(),
        };
        if !parts.is_empty() {
            contents.push(gemini::Content {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    let thinking_config = request.thinking.as_ref().and_then(|thinking| {
        if thinking.kind != "enabled" {
            return None;
        }
        Some(gemini::ThinkingConfig {
            thinking_budget: thinking.budget_tokens.map(|budget| budget as i32),
        })
    });

    gemini::GenerateContentRequest {
        contents,
        system_instruction: request.system.as_ref().and_then(|system| {
            let text = system.joined_text();
            (!text.is_empty()).then(|| gemini::Content::text(None, text))
        }),
        generation_config: Some(gemini::GenerationConfig {
            max_output_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop_sequences.clone(),
            thinking_config,
        }),
    }
}

fn map_block(block: &claude::ContentBlock) -> Option<gemini::Part> {
    match block {
        claude::ContentBlock::Text { text } => Some(gemini::Part {
            text: Some(text.clone()),
            inline_data: None,
        }),
        claude::ContentBlock::Image { source } => {
            let media_type = source.media_type.clone()?;
            let data = source.data.clone()?;
            Some(gemini::Part {
                text: None,
                inline_data: Some(gemini::Blob {
                    mime_type: media_type,
                    data,
                }),
            })
        }
        claude::ContentBlock::ToolResult { content, .. } => Some(gemini::Part {
            text: Some(tool_result_text(content)),
            inline_data: None,
        }),
        // Tool declarations and reasoning traces are dropped; the Gemini
        // function-calling schema is not part of this translation.
        _ => None,
    }
}

fn tool_result_text(content: &JsonValue) -> String {
    match content {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn stop_reason_from_gemini(finish: Option<&str>) -> Option<String> {
    finish.map(|finish| {
        match finish {
            "STOP" => "end_turn",
            "MAX_TOKENS" => "max_tokens",
            other => other,
        }
        .to_string()
    })
}

pub fn claude_usage_from_gemini(usage: &gemini::UsageMetadata) -> claude::Usage {
    claude::Usage {
        input_tokens: usage.prompt_token_count.unwrap_or(0),
        output_tokens: usage
            .candidates_token_count
            .unwrap_or(0)
            .saturating_add(usage.thoughts_token_count.unwrap_or(0)),
        cache_creation_input_tokens: None,
        cache_read_input_tokens: usage.cached_content_token_count,
    }
}

/// Convert a buffered Gemini response into a Claude message.
pub fn messages_response_from_gemini(
    response: &gemini::GenerateContentResponse,
    model: &str,
) -> claude::MessageResponse {
    let mut content = Vec::new();
    let mut stop_reason = None;
    if let Some(candidate) = response.candidates.first() {
        if let Some(candidate_content) = candidate.content.as_ref() {
            let text = candidate_content.joined_text();
            if !text.is_empty() {
                content.push(claude::ContentBlock::Text { text });
            }
        }
        stop_reason = stop_reason_from_gemini(candidate.finish_reason.as_deref());
    }
    claude::MessageResponse {
        id: "msg_gemini".to_string(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage: response
            .usage_metadata
            .as_ref()
            .map(claude_usage_from_gemini)
            .unwrap_or_default(),
    }
}

/// Re-frames a Gemini stream into Claude stream events.
pub struct GeminiToMessagesStream {
    model: String,
    started: bool,
    block_open: bool,
    finish_reason: Option<String>,
    usage: Option<claude::Usage>,
}

impl GeminiToMessagesStream {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            started: false,
            block_open: false,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn push(&mut self, payload: &str) -> Vec<claude::StreamEvent> {
        let Ok(response) = serde_json::from_str::<gemini::GenerateContentResponse>(payload) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(claude::StreamEvent::MessageStart {
                message: claude::MessageResponse {
                    id: "msg_gemini".to_string(),
                    kind: "message".to_string(),
                    role: "assistant".to_string(),
                    content: Vec::new(),
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: claude::Usage::default(),
                },
            });
        }
        if let Some(usage) = response.usage_metadata.as_ref() {
            self.usage = Some(claude_usage_from_gemini(usage));
        }
        for candidate in &response.candidates {
            if let Some(content) = candidate.content.as_ref() {
                let text = content.joined_text();
                if !text.is_empty() {
                    if !self.block_open {
                        self.block_open = true;
                        events.push(claude::StreamEvent::ContentBlockStart {
                            index: 0,
                            content_block: claude::ContentBlock::Text {
                                text: String::new(),
                            },
                        });
                    }
                    events.push(claude::StreamEvent::ContentBlockDelta {
                        index: 0,
                        delta: claude::BlockDelta::TextDelta { text },
                    });
                }
            }
            if let Some(finish) = candidate.finish_reason.as_deref() {
                self.finish_reason = stop_reason_from_gemini(Some(finish));
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            return events;
        }
        if self.block_open {
            events.push(claude::StreamEvent::ContentBlockStop { index: 0 });
            self.block_open = false;
        }
        events.push(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDelta {
                stop_reason: Some(
                    self.finish_reason
                        .take()
                        .unwrap_or_else(|| "end_turn".to_string()),
                ),
                stop_sequence: None,
            },
            usage: self.usage.take(),
        });
        events.push(claude::StreamEvent::MessageStop);
        events
    }
}
