//! Claude messages ↔ OpenAI chat completions.

use serde_json::{json, Value as JsonValue};

use qgate_protocol::claude;
use qgate_protocol::openai;

/// Convert a Claude messages request into an OpenAI chat request.
pub fn chat_request_from_messages(request: &claude::MessagesRequest) -> openai::ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = request.system.as_ref() {
        let text = system.joined_text();
        if !text.is_empty() {
            messages.push(openai::ChatMessage::text("system", text));
        }
    }
    for message in &request.messages {
        messages.extend(map_claude_message(message));
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| openai::ChatTool {
                kind: "function".to_string(),
                function: openai::FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.input_schema.clone()),
                },
            })
            .collect::<Vec<_>>()
    });

    openai::ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: None,
        max_completion_tokens: Some(request.max_tokens),
        stream: request.stream,
        stream_options: None,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request
            .stop_sequences
            .as_ref()
            .map(|stops| json!(stops)),
        tools,
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice),
        reasoning_effort: request
            .thinking
            .as_ref()
            .and_then(reasoning_effort_for_thinking),
        user: None,
    }
}

fn map_claude_message(message: &claude::Message) -> Vec<openai::ChatMessage> {
    let role = match message.role {
        claude::Role::User => "user",
        claude::Role::Assistant => "assistant",
    };
    let blocks = match &message.content {
        claude::MessageContent::Text(text) => {
            return vec![openai::ChatMessage::text(role, text.clone())];
        }
        claude::MessageContent::Blocks(blocks) => blocks,
    };

    let mut out = Vec::new();
    let mut parts: Vec<openai::ContentPart> = Vec::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();

    for block in blocks {
        match block {
            claude::ContentBlock::Text { text } => {
                parts.push(openai::ContentPart::Text { text: text.clone() });
            }
            claude::ContentBlock::Image { source } => {
                let url = source.url.clone().or_else(|| {
                    let media_type = source.media_type.as_deref()?;
                    let data = source.data.as_deref()?;
                    Some(format!("data:{media_type};base64,{data}"))
                });
                if let Some(url) = url {
                    parts.push(openai::ContentPart::ImageUrl {
                        image_url: openai::ImageUrl { url, detail: None },
                    });
                }
            }
            claude::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    index: Some(tool_calls.len() as u32),
                    id: Some(id.clone()),
                    kind: Some("function".to_string()),
                    function: openai::FunctionCall {
                        name: Some(name.clone()),
                        arguments: Some(input.to_string()),
                    },
                });
            }
            claude::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                out.push(openai::ChatMessage {
                    role: "tool".to_string(),
                    content: Some(openai::ChatContent::Text(tool_result_text(content))),
                    tool_call_id: Some(tool_use_id.clone()),
                    ..Default::default()
                });
            }
            // Reasoning traces have no chat-completions request encoding.
            claude::ContentBlock::Thinking { .. }
            | claude::ContentBlock::RedactedThinking { .. } => {}
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() {
        let content = match parts.len() {
            0 => None,
            // A single text part collapses to the plain-string form.
            1 if matches!(parts[0], openai::ContentPart::Text { .. }) => {
                match parts.into_iter().next() {
                    Some(openai::ContentPart::Text { text }) => {
                        Some(openai::ChatContent::Text(text))
                    }
                    _ => None,
                }
            }
            _ => Some(openai::ChatContent::Parts(parts)),
        };
        out.insert(
            0,
            openai::ChatMessage {
                role: role.to_string(),
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                ..Default::default()
            },
        );
    }
    out
}

fn tool_result_text(content: &JsonValue) -> String {
    match content {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => String::new(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|text| text.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn map_tool_choice(choice: &JsonValue) -> JsonValue {
    match choice.get("type").and_then(|kind| kind.as_str()) {
        Some("auto") => json!("auto"),
        Some("any") => json!("required"),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": choice.get("name").cloned().unwrap_or(JsonValue::Null)}
        }),
        _ => choice.clone(),
    }
}

fn reasoning_effort_for_thinking(thinking: &claude::ThinkingConfig) -> Option<String> {
    if thinking.kind != "enabled" {
        return None;
    }
    let budget = thinking.budget_tokens.unwrap_or(0);
    let effort = if budget < 4096 {
        "low"
    } else if budget < 16384 {
        "medium"
    } else {
        "high"
    };
    Some(effort.to_string())
}

/// Convert an OpenAI chat request into a Claude messages request.
pub fn messages_request_from_chat(request: &openai::ChatRequest) -> claude::MessagesRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<claude::Message> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = message.content.as_ref() {
                    system_parts.push(content.joined_text());
                }
            }
            "tool" => {
                let block = claude::ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: JsonValue::String(
                        message
                            .content
                            .as_ref()
                            .map(|content| content.joined_text())
                            .unwrap_or_default(),
                    ),
                    is_error: None,
                };
                // Consecutive tool results fold into one user turn.
                if let Some(claude::Message {
                    role: claude::Role::User,
                    content: claude::MessageContent::Blocks(blocks),
                }) = messages.last_mut()
                {
                    if matches!(blocks.last(), Some(claude::ContentBlock::ToolResult { .. })) {
                        blocks.push(block);
                        continue;
                    }
                }
                messages.push(claude::Message {
                    role: claude::Role::User,
                    content: claude::MessageContent::Blocks(vec![block]),
                });
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(content) = message.content.as_ref() {
                    let text = content.joined_text();
                    if !text.is_empty() {
                        blocks.push(claude::ContentBlock::Text { text });
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    let input = call
                        .function
                        .arguments
                        .as_deref()
                        .and_then(|arguments| serde_json::from_str(arguments).ok())
                        .unwrap_or_else(|| json!({}));
                    blocks.push(claude::ContentBlock::ToolUse {
                        id: call.id.clone().unwrap_or_default(),
                        name: call.function.name.clone().unwrap_or_default(),
                        input,
                    });
                }
                if !blocks.is_empty() {
                    messages.push(claude::Message {
                        role: claude::Role::Assistant,
                        content: claude::MessageContent::Blocks(blocks),
                    });
                }
            }
            _ => {
                let content = match message.content.as_ref() {
                    Some(openai::ChatContent::Text(text)) => {
                        claude::MessageContent::Text(text.clone())
                    }
                    Some(openai::ChatContent::Parts(parts)) => {
                        claude::MessageContent::Blocks(map_user_parts(parts))
                    }
                    None => claude::MessageContent::Text(String::new()),
                };
                messages.push(claude::Message {
                    role: claude::Role::User,
                    content,
                });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| claude::Tool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
            .collect::<Vec<_>>()
    });

    claude::MessagesRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.completion_limit().unwrap_or(4096),
        system: (!system_parts.is_empty()).then(|| {
            claude::SystemPrompt::Text(system_parts.join("\n"))
        }),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop.as_ref().and_then(map_stop),
        tools,
        tool_choice: request.tool_choice.as_ref().map(unmap_tool_choice),
        thinking: None,
        metadata: request
            .user
            .as_ref()
            .map(|user| json!({"user_id": user})),
        anthropic_version: None,
    }
}

fn map_user_parts(parts: &[openai::ContentPart]) -> Vec<claude::ContentBlock> {
    parts
        .iter()
        .filter_map(|part| match part {
            openai::ContentPart::Text { text } => {
                Some(claude::ContentBlock::Text { text: text.clone() })
            }
            openai::ContentPart::ImageUrl { image_url } => {
                Some(claude::ContentBlock::Image {
                    source: image_source_from_url(&image_url.url)?,
                })
            }
        })
        .collect()
}

fn image_source_from_url(url: &str) -> Option<claude::ImageSource> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (media_type, data) = rest.split_once(";base64,")?;
        return Some(claude::ImageSource {
            kind: "base64".to_string(),
            media_type: Some(media_type.to_string()),
            data: Some(data.to_string()),
            url: None,
        });
    }
    Some(claude::ImageSource {
        kind: "url".to_string(),
        media_type: None,
        data: None,
        url: Some(url.to_string()),
    })
}

fn map_stop(stop: &JsonValue) -> Option<Vec<String>> {
    match stop {
        JsonValue::String(stop) => Some(vec![stop.clone()]),
        JsonValue::Array(stops) => Some(
            stops
                .iter()
                .filter_map(|stop| stop.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

fn unmap_tool_choice(choice: &JsonValue) -> JsonValue {
    match choice {
        JsonValue::String(mode) => match mode.as_str() {
            "required" => json!({"type": "any"}),
            _ => json!({"type": "auto"}),
        },
        object => json!({
            "type": "tool",
            "name": object
                .get("function")
                .and_then(|function| function.get("name"))
                .cloned()
                .unwrap_or(JsonValue::Null)
        }),
    }
}

pub fn stop_reason_from_finish(finish: Option<&str>) -> Option<String> {
    finish.map(|finish| {
        match finish {
            "stop" => "end_turn",
            "length" => "max_tokens",
            "tool_calls" | "function_call" => "tool_use",
            other => other,
        }
        .to_string()
    })
}

pub fn finish_reason_from_stop(stop: Option<&str>) -> Option<String> {
    stop.map(|stop| {
        match stop {
            "end_turn" | "stop_sequence" => "stop",
            "max_tokens" => "length",
            "tool_use" => "tool_calls",
            other => other,
        }
        .to_string()
    })
}

pub fn claude_usage_from_chat(usage: &openai::ChatUsage) -> claude::Usage {
    claude::Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens),
    }
}

pub fn chat_usage_from_claude(usage: &claude::Usage) -> openai::ChatUsage {
    let total = usage.input_tokens + usage.output_tokens;
    openai::ChatUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: total,
        prompt_tokens_details: usage.cache_read_input_tokens.map(|cached| {
            openai::PromptTokensDetails {
                cached_tokens: Some(cached),
            }
        }),
        completion_tokens_details: None,
    }
}

/// Convert a buffered OpenAI chat response into a Claude message.
pub fn messages_response_from_chat(
    response: &openai::ChatResponse,
    model: &str,
) -> claude::MessageResponse {
    let mut content = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = response.choices.first() {
        if let Some(text) = choice
            .message
            .content
            .as_ref()
            .map(|value| value.joined_text())
        {
            if !text.is_empty() {
                content.push(claude::ContentBlock::Text { text });
            }
        }
        for call in choice.message.tool_calls.iter().flatten() {
            let input = call
                .function
                .arguments
                .as_deref()
                .and_then(|arguments| serde_json::from_str(arguments).ok())
                .unwrap_or_else(|| json!({}));
            content.push(claude::ContentBlock::ToolUse {
                id: call.id.clone().unwrap_or_default(),
                name: call.function.name.clone().unwrap_or_default(),
                input,
            });
        }
        stop_reason = stop_reason_from_finish(choice.finish_reason.as_deref());
    }

    claude::MessageResponse {
        id: response.id.clone(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage: response
            .usage
            .as_ref()
            .map(claude_usage_from_chat)
            .unwrap_or_default(),
    }
}

/// Convert a buffered Claude message into an OpenAI chat response.
pub fn chat_response_from_messages(message: &claude::MessageResponse) -> openai::ChatResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &message.content {
        match block {
            claude::ContentBlock::Text { text: part } => text.push_str(part),
            claude::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    index: Some(tool_calls.len() as u32),
                    id: Some(id.clone()),
                    kind: Some("function".to_string()),
                    function: openai::FunctionCall {
                        name: Some(name.clone()),
                        arguments: Some(input.to_string()),
                    },
                });
            }
            _ => {}
        }
    }

    openai::ChatResponse {
        id: message.id.clone(),
        object: Some("chat.completion".to_string()),
        created: Some(epoch_seconds()),
        model: message.model.clone(),
        choices: vec![openai::Choice {
            index: 0,
            message: openai::ChatMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty()).then_some(openai::ChatContent::Text(text)),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                ..Default::default()
            },
            finish_reason: finish_reason_from_stop(message.stop_reason.as_deref()),
        }],
        usage: Some(chat_usage_from_claude(&message.usage)),
    }
}

pub(crate) fn epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

/// Re-frames an OpenAI chat stream into Claude stream events.
pub struct ChatToMessagesStream {
    model: String,
    started: bool,
    block_index: usize,
    text_open: bool,
    tool_open: bool,
    finish_reason: Option<String>,
    usage: Option<claude::Usage>,
}

impl ChatToMessagesStream {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            started: false,
            block_index: 0,
            text_open: false,
            tool_open: false,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn push(&mut self, payload: &str) -> Vec<claude::StreamEvent> {
        if payload == "[DONE]" {
            return Vec::new();
        }
        let Ok(chunk) = serde_json::from_str::<openai::ChatStreamChunk>(payload) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(claude::StreamEvent::MessageStart {
                message: claude::MessageResponse {
                    id: chunk.id.clone().unwrap_or_else(|| "msg_stream".to_string()),
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
        if let Some(usage) = chunk.usage.as_ref() {
            self.usage = Some(claude_usage_from_chat(usage));
        }

        for choice in &chunk.choices {
            for call in choice.delta.tool_calls.iter().flatten() {
                if let Some(name) = call.function.name.as_ref() {
                    self.close_open_block(&mut events);
                    events.push(claude::StreamEvent::ContentBlockStart {
                        index: self.block_index,
                        content_block: claude::ContentBlock::ToolUse {
                            id: call.id.clone().unwrap_or_default(),
                            name: name.clone(),
                            input: json!({}),
                        },
                    });
                    self.tool_open = true;
                }
                if let Some(arguments) = call.function.arguments.as_ref() {
                    if self.tool_open && !arguments.is_empty() {
                        events.push(claude::StreamEvent::ContentBlockDelta {
                            index: self.block_index,
                            delta: claude::BlockDelta::InputJsonDelta {
                                partial_json: arguments.clone(),
                            },
                        });
                    }
                }
            }
            if let Some(text) = choice.delta.content.as_ref() {
                if !text.is_empty() {
                    if !self.text_open {
                        self.close_open_block(&mut events);
                        events.push(claude::StreamEvent::ContentBlockStart {
                            index: self.block_index,
                            content_block: claude::ContentBlock::Text {
                                text: String::new(),
                            },
                        });
                        self.text_open = true;
                    }
                    events.push(claude::StreamEvent::ContentBlockDelta {
                        index: self.block_index,
                        delta: claude::BlockDelta::TextDelta { text: text.clone() },
                    });
                }
            }
            if let Some(finish) = choice.finish_reason.as_deref() {
                self.finish_reason = stop_reason_from_finish(Some(finish));
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            return events;
        }
        self.close_open_block(&mut events);
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

    fn close_open_block(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if self.text_open || self.tool_open {
            events.push(claude::StreamEvent::ContentBlockStop {
                index: self.block_index,
            });
            self.block_index += 1;
            self.text_open = false;
            self.tool_open = false;
        }
    }
}

/// Re-frames Claude stream events into OpenAI chat chunks.
pub struct MessagesToChatStream {
    id: String,
    model: String,
    created: i64,
    prompt_usage: Option<claude::Usage>,
    finished: bool,
}

impl MessagesToChatStream {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: "chatcmpl-stream".to_string(),
            model: model.into(),
            created: epoch_seconds(),
            prompt_usage: None,
            finished: false,
        }
    }

    pub fn push(&mut self, event: &claude::StreamEvent) -> Vec<openai::ChatStreamChunk> {
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                self.prompt_usage = Some(message.usage.clone());
                vec![self.chunk(
                    openai::ChatDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        tool_calls: None,
                    },
                    None,
                )]
            }
            claude::StreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                claude::ContentBlock::ToolUse { id, name, .. } => vec![self.chunk(
                    openai::ChatDelta {
                        role: None,
                        content: None,
                        tool_calls: Some(vec![openai::ToolCall {
                            index: Some(0),
                            id: Some(id.clone()),
                            kind: Some("function".to_string()),
                            function: openai::FunctionCall {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            },
                        }]),
                    },
                    None,
                )],
                _ => Vec::new(),
            },
            claude::StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                claude::BlockDelta::TextDelta { text } => vec![self.chunk(
                    openai::ChatDelta {
                        role: None,
                        content: Some(text.clone()),
                        tool_calls: None,
                    },
                    None,
                )],
                claude::BlockDelta::InputJsonDelta { partial_json } => vec![self.chunk(
                    openai::ChatDelta {
                        role: None,
                        content: None,
                        tool_calls: Some(vec![openai::ToolCall {
                            index: Some(0),
                            id: None,
                            kind: None,
                            function: openai::FunctionCall {
                                name: None,
                                arguments: Some(partial_json.clone()),
                            },
                        }]),
                    },
                    None,
                )],
                _ => Vec::new(),
            },
            claude::StreamEvent::MessageDelta { delta, usage } => {
                self.finished = true;
                let mut chunks = vec![self.chunk(
                    openai::ChatDelta::default(),
                    finish_reason_from_stop(delta.stop_reason.as_deref())
                        .or_else(|| Some("stop".to_string())),
                )];
                if let Some(usage) = usage {
                    let mut merged = usage.clone();
                    if merged.input_tokens == 0 {
                        if let Some(prompt) = self.prompt_usage.as_ref() {
                            merged.input_tokens = prompt.input_tokens;
                            merged.cache_read_input_tokens = prompt.cache_read_input_tokens;
                        }
                    }
                    chunks.push(openai::ChatStreamChunk {
                        id: Some(self.id.clone()),
                        object: Some("chat.completion.chunk".to_string()),
                        created: Some(self.created),
                        model: Some(self.model.clone()),
                        choices: Vec::new(),
                        usage: Some(chat_usage_from_claude(&merged)),
                    });
                }
                chunks
            }
            _ => Vec::new(),
        }
    }

    fn chunk(
        &self,
        delta: openai::ChatDelta,
        finish_reason: Option<String>,
    ) -> openai::ChatStreamChunk {
        openai::ChatStreamChunk {
            id: Some(self.id.clone()),
            object: Some("chat.completion.chunk".to_string()),
            created: Some(self.created),
            model: Some(self.model.clone()),
            choices: vec![openai::StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}
