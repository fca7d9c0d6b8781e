//! Deterministic prompt-token estimation.
//!
//! A pure function of the payload and the model string; no network IO. The
//! estimate feeds pre-consumption pricing and the settlement floor, so it
//! must be stable across calls for the same input.

use tiktoken_rs::{cl100k_base, get_bpe_from_model, o200k_base, CoreBPE};

use qgate_protocol::{claude, openai};

use crate::error::RelayError;
use crate::info::InboundRequest;

const TOKENS_PER_MESSAGE: u64 = 4;
const REPLY_PRIMING_TOKENS: u64 = 3;
const TOKENS_PER_TOOL: u64 = 8;

// Images are billed per 512px tile; without decoded dimensions the estimator
// charges a full-size default (Claude caps images at ~1568 tokens, OpenAI
// high-detail at base 85 + 2 tiles).
const CLAUDE_IMAGE_TOKENS: u64 = 1568;
const OPENAI_IMAGE_BASE_TOKENS: u64 = 85;
const OPENAI_IMAGE_TILE_TOKENS: u64 = 170;

/// Estimates the prompt token count of an inbound request.
pub trait TokenCounter: Send + Sync {
    fn count(&self, inbound: &InboundRequest, model: &str) -> Result<u64, RelayError>;
}

/// The default estimator, backed by tiktoken BPEs.
pub struct TiktokenCounter;

impl TokenCounter for TiktokenCounter {
    fn count(&self, inbound: &InboundRequest, model: &str) -> Result<u64, RelayError> {
        count_prompt_tokens(inbound, model)
    }
}

pub fn count_prompt_tokens(inbound: &InboundRequest, model: &str) -> Result<u64, RelayError> {
    let bpe = encoder_for_model(model)?;
    let total = match inbound {
        InboundRequest::ClaudeMessages(request) => count_claude_request(request, model, &bpe),
        InboundRequest::ChatCompletions(request) => count_chat_request(request, &bpe),
    };
    Ok(total)
}

fn encoder_for_model(model: &str) -> Result<CoreBPE, RelayError> {
    if let Ok(bpe) = get_bpe_from_model(model) {
        return Ok(bpe);
    }
    let result = if is_o200k_model(model) {
        o200k_base()
    } else {
        cl100k_base()
    };
    result.map_err(|err| RelayError::CountFailed(err.to_string()))
}

fn is_o200k_model(model: &str) -> bool {
    model.starts_with("gpt-5")
        || model.starts_with("gpt-4.1")
        || model.starts_with("gpt-4o")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
}

fn count_text(text: &str, bpe: &CoreBPE) -> u64 {
    bpe.encode_ordinary(text).len() as u64
}

fn count_claude_request(request: &claude::MessagesRequest, model: &str, bpe: &CoreBPE) -> u64 {
    let mut total = REPLY_PRIMING_TOKENS;
    if let Some(system) = request.system.as_ref() {
        total += count_text(&system.joined_text(), bpe);
    }
    for message in &request.messages {
        total += TOKENS_PER_MESSAGE;
        total += count_claude_content(&message.content, model, bpe);
    }
    if let Some(tools) = request.tools.as_ref() {
        for tool in tools {
            total += TOKENS_PER_TOOL;
            total += count_text(&tool.name, bpe);
            if let Some(description) = tool.description.as_deref() {
                total += count_text(description, bpe);
            }
            total += count_json(&tool.input_schema, bpe);
        }
    }
    total
}

fn count_claude_content(content: &claude::MessageContent, model: &str, bpe: &CoreBPE) -> u64 {
    match content {
        claude::MessageContent::Text(text) => count_text(text, bpe),
        claude::MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| count_claude_block(block, model, bpe))
            .sum(),
    }
}

fn count_claude_block(block: &claude::ContentBlock, model: &str, bpe: &CoreBPE) -> u64 {
    match block {
        claude::ContentBlock::Text { text } => count_text(text, bpe),
        claude::ContentBlock::Image { .. } => image_tokens(model),
        claude::ContentBlock::ToolUse { name, input, .. } => {
            count_text(name, bpe) + count_json(input, bpe)
        }
        claude::ContentBlock::ToolResult { content, .. } => count_json(content, bpe),
        claude::ContentBlock::Thinking { thinking, .. } => count_text(thinking, bpe),
        claude::ContentBlock::RedactedThinking { .. } => 0,
    }
}

fn count_chat_request(request: &openai::ChatRequest, bpe: &CoreBPE) -> u64 {
    let mut total = REPLY_PRIMING_TOKENS;
    for message in &request.messages {
        total += TOKENS_PER_MESSAGE;
        total += count_text(&message.role, bpe);
        if let Some(content) = message.content.as_ref() {
            total += count_chat_content(content, &request.model, bpe);
        }
        if let Some(calls) = message.tool_calls.as_ref() {
            for call in calls {
                if let Some(name) = call.function.name.as_deref() {
                    total += count_text(name, bpe);
                }
                if let Some(arguments) = call.function.arguments.as_deref() {
                    total += count_text(arguments, bpe);
                }
            }
        }
    }
    if let Some(tools) = request.tools.as_ref() {
        for tool in tools {
            total += TOKENS_PER_TOOL;
            total += count_text(&tool.function.name, bpe);
            if let Some(description) = tool.function.description.as_deref() {
                total += count_text(description, bpe);
            }
            if let Some(parameters) = tool.function.parameters.as_ref() {
                total += count_json(parameters, bpe);
            }
        }
    }
    total
}

fn count_chat_content(content: &openai::ChatContent, model: &str, bpe: &CoreBPE) -> u64 {
    match content {
        openai::ChatContent::Text(text) => count_text(text, bpe),
        openai::ChatContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                openai::ContentPart::Text { text } => count_text(text, bpe),
                openai::ContentPart::ImageUrl { image_url } => {
                    openai_image_tokens(image_url.detail.as_deref())
                }
            })
            .sum(),
    }
}

fn count_json(value: &serde_json::Value, bpe: &CoreBPE) -> u64 {
    if value.is_null() {
        return 0;
    }
    match serde_json::to_string(value) {
        Ok(text) => count_text(&text, bpe),
        Err(_) => 0,
    }
}

fn image_tokens(model: &str) -> u64 {
    if model.starts_with("claude") {
        CLAUDE_IMAGE_TOKENS
    } else {
        openai_image_tokens(None)
    }
}

fn openai_image_tokens(detail: Option<&str>) -> u64 {
    match detail {
        Some("low") => OPENAI_IMAGE_BASE_TOKENS,
        // Unknown dimensions: charge the base plus two tiles.
        _ => OPENAI_IMAGE_BASE_TOKENS + 2 * OPENAI_IMAGE_TILE_TOKENS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgate_protocol::claude::{
        ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Role,
    };

    fn claude_request(content: MessageContent) -> InboundRequest {
        InboundRequest::ClaudeMessages(MessagesRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            messages: vec![Message {
                role: Role::User,
                content,
            }],
            max_tokens: 16,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
            anthropic_version: None,
        })
    }

    #[test]
    fn counting_is_deterministic() {
        let inbound = claude_request(MessageContent::Text("hello there, counting test".into()));
        let first = count_prompt_tokens(&inbound, "claude-3-5-sonnet-20241022").unwrap();
        let second = count_prompt_tokens(&inbound, "claude-3-5-sonnet-20241022").unwrap();
        assert_eq!(first, second);
        assert!(first > REPLY_PRIMING_TOKENS + TOKENS_PER_MESSAGE);
    }

    #[test]
    fn images_bill_a_tile_amount() {
        let text_only = claude_request(MessageContent::Text("hi".into()));
        let with_image = claude_request(MessageContent::Blocks(vec![
            ContentBlock::Text { text: "hi".into() },
            ContentBlock::Image {
                source: ImageSource {
                    kind: "base64".into(),
                    media_type: Some("image/png".into()),
                    data: Some("AAAA".into()),
                    url: None,
                },
            },
        ]));
        let base = count_prompt_tokens(&text_only, "claude-3-5-sonnet-20241022").unwrap();
        let with_image = count_prompt_tokens(&with_image, "claude-3-5-sonnet-20241022").unwrap();
        assert_eq!(with_image, base + CLAUDE_IMAGE_TOKENS);
    }

    #[test]
    fn longer_prompts_count_more() {
        let short = claude_request(MessageContent::Text("hi".into()));
        let long = claude_request(MessageContent::Text(
            "a considerably longer prompt that should tokenize to more tokens".into(),
        ));
        assert!(
            count_prompt_tokens(&long, "claude-3-5-sonnet-20241022").unwrap()
                > count_prompt_tokens(&short, "claude-3-5-sonnet-20241022").unwrap()
        );
    }
}
