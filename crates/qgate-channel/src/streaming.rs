//! Shared response handling: usage accumulation over stream events, SSE
//! re-framing between dialects, and the pump that moves upstream bytes to
//! the client sink.

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use serde_json::Value as JsonValue;

use qgate_protocol::sse::{encode_frame, PayloadDecoder};
use qgate_protocol::{claude, gemini, openai};
use qgate_relay::{ClientSink, RelayError, StreamHead, UpstreamBody, UpstreamResponse, Usage};

use crate::translate::claude_gemini::{
    claude_usage_from_gemini, messages_response_from_gemini, GeminiToMessagesStream,
};
use crate::translate::claude_openai::{
    chat_response_from_messages, messages_response_from_chat, ChatToMessagesStream,
    MessagesToChatStream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamDialect {
    Claude,
    OpenAiChat,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundDialect {
    Claude,
    OpenAiChat,
}

pub(crate) fn usage_from_claude(usage: &claude::Usage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        cached_input_tokens: usage.cache_read_input_tokens,
        reasoning_tokens: None,
    }
}

pub(crate) fn usage_from_chat(usage: &openai::ChatUsage) -> Usage {
    let total = if usage.total_tokens != 0 {
        usage.total_tokens
    } else {
        usage.prompt_tokens + usage.completion_tokens
    };
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: total,
        cached_input_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens),
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .and_then(|details| details.reasoning_tokens),
    }
}

pub(crate) fn usage_from_gemini(usage: &gemini::UsageMetadata) -> Usage {
    let claude_usage = claude_usage_from_gemini(usage);
    let mut out = usage_from_claude(&claude_usage);
    out.reasoning_tokens = usage.thoughts_token_count;
    if let Some(total) = usage.total_token_count {
        out.total_tokens = total;
    }
    out
}

/// Accumulates usage from raw stream payloads in the upstream's dialect.
/// The terminal event wins; Claude splits input (message_start) and output
/// (message_delta) across events, so fields merge instead of replacing.
pub(crate) struct UsageTracker {
    dialect: UpstreamDialect,
    usage: Option<Usage>,
}

impl UsageTracker {
    pub(crate) fn new(dialect: UpstreamDialect) -> Self {
        Self {
            dialect,
            usage: None,
        }
    }

    pub(crate) fn observe(&mut self, payload: &str) {
        if payload == "[DONE]" {
            return;
        }
        match self.dialect {
            UpstreamDialect::Claude => self.observe_claude(payload),
            UpstreamDialect::OpenAiChat => self.observe_chat(payload),
            UpstreamDialect::Gemini => self.observe_gemini(payload),
        }
    }

    fn observe_claude(&mut self, payload: &str) {
        let Ok(value) = serde_json::from_str::<JsonValue>(payload) else {
            return;
        };
        let usage = value
            .get("usage")
            .or_else(|| value.get("message").and_then(|message| message.get("usage")));
        let Some(usage) = usage else { return };

        let entry = self.usage.get_or_insert_with(Usage::default);
        if let Some(input) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
            if input > 0 {
                entry.prompt_tokens = input;
            }
        }
        if let Some(output) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
            entry.completion_tokens = output;
        }
        if let Some(cached) = usage
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())
        {
            entry.cached_input_tokens = Some(cached);
        }
        entry.total_tokens = entry.prompt_tokens + entry.completion_tokens;
    }

    fn observe_chat(&mut self, payload: &str) {
        let Ok(chunk) = serde_json::from_str::<openai::ChatStreamChunk>(payload) else {
            return;
        };
        if let Some(usage) = chunk.usage.as_ref() {
            self.usage = Some(usage_from_chat(usage));
        }
    }

    fn observe_gemini(&mut self, payload: &str) {
        let Ok(response) = serde_json::from_str::<gemini::GenerateContentResponse>(payload) else {
            return;
        };
        if let Some(usage) = response.usage_metadata.as_ref() {
            self.usage = Some(usage_from_gemini(usage));
        }
    }

    pub(crate) fn current(&self) -> Option<Usage> {
        self.usage
    }
}

/// Converts upstream stream payloads into client frames in the inbound
/// dialect. Cross-dialect pairs pivot through Claude stream events.
pub(crate) enum Reframer {
    ClaudePassthrough,
    OpenAiPassthrough,
    ChatToClaude(ChatToMessagesStream),
    GeminiToClaude(GeminiToMessagesStream),
    ClaudeToChat(MessagesToChatStream),
    GeminiToChat(GeminiToMessagesStream, MessagesToChatStream),
}

impl Reframer {
    pub(crate) fn new(upstream: UpstreamDialect, inbound: InboundDialect, model: &str) -> Self {
        match (upstream, inbound) {
            (UpstreamDialect::Claude, InboundDialect::Claude) => Reframer::ClaudePassthrough,
            (UpstreamDialect::OpenAiChat, InboundDialect::OpenAiChat) => {
                Reframer::OpenAiPassthrough
            }
            (UpstreamDialect::OpenAiChat, InboundDialect::Claude) => {
                Reframer::ChatToClaude(ChatToMessagesStream::new(model))
            }
            (UpstreamDialect::Gemini, InboundDialect::Claude) => {
                Reframer::GeminiToClaude(GeminiToMessagesStream::new(model))
            }
            (UpstreamDialect::Claude, InboundDialect::OpenAiChat) => {
                Reframer::ClaudeToChat(MessagesToChatStream::new(model))
            }
            (UpstreamDialect::Gemini, InboundDialect::OpenAiChat) => Reframer::GeminiToChat(
                GeminiToMessagesStream::new(model),
                MessagesToChatStream::new(model),
            ),
        }
    }

    pub(crate) fn push(&mut self, payload: &str) -> Vec<Bytes> {
        match self {
            Reframer::ClaudePassthrough => {
                if payload == "[DONE]" {
                    return Vec::new();
                }
                let name = serde_json::from_str::<JsonValue>(payload)
                    .ok()
                    .and_then(|value| {
                        value
                            .get("type")
                            .and_then(|kind| kind.as_str())
                            .map(str::to_string)
                    });
                vec![encode_frame(name.as_deref(), payload)]
            }
            Reframer::OpenAiPassthrough => {
                if payload == "[DONE]" {
                    return Vec::new();
                }
                vec![encode_frame(None, payload)]
            }
            Reframer::ChatToClaude(state) => encode_claude_events(state.push(payload)),
            Reframer::GeminiToClaude(state) => encode_claude_events(state.push(payload)),
            Reframer::ClaudeToChat(state) => {
                let Ok(event) = serde_json::from_str::<claude::StreamEvent>(payload) else {
                    return Vec::new();
                };
                encode_chat_chunks(state.push(&event))
            }
            Reframer::GeminiToChat(gemini_state, chat_state) => {
                let events = gemini_state.push(payload);
                let mut frames = Vec::new();
                for event in &events {
                    frames.extend(encode_chat_chunks(chat_state.push(event)));
                }
                frames
            }
        }
    }

    pub(crate) fn finish(&mut self) -> Vec<Bytes> {
        match self {
            Reframer::ClaudePassthrough => Vec::new(),
            Reframer::OpenAiPassthrough => vec![encode_frame(None, "[DONE]")],
            Reframer::ChatToClaude(state) => encode_claude_events(state.finish()),
            Reframer::GeminiToClaude(state) => encode_claude_events(state.finish()),
            Reframer::ClaudeToChat(_) => vec![encode_frame(None, "[DONE]")],
            Reframer::GeminiToChat(gemini_state, chat_state) => {
                let mut frames = Vec::new();
                for event in &gemini_state.finish() {
                    frames.extend(encode_chat_chunks(chat_state.push(event)));
                }
                frames.push(encode_frame(None, "[DONE]"));
                frames
            }
        }
    }
}

fn encode_claude_events(events: Vec<claude::StreamEvent>) -> Vec<Bytes> {
    events
        .into_iter()
        .filter_map(|event| {
            let data = serde_json::to_string(&event).ok()?;
            Some(encode_frame(Some(event.event_name()), &data))
        })
        .collect()
}

fn encode_chat_chunks(chunks: Vec<openai::ChatStreamChunk>) -> Vec<Bytes> {
    chunks
        .into_iter()
        .filter_map(|chunk| {
            let data = serde_json::to_string(&chunk).ok()?;
            Some(encode_frame(None, &data))
        })
        .collect()
}

fn sse_head() -> StreamHead {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    StreamHead {
        status: 200,
        headers,
    }
}

/// Drive a streaming upstream response to the client: decode payloads,
/// track usage, re-frame, forward. A failed client write or a broken
/// upstream read surfaces as `ResponseFailed` carrying the usage seen so
/// far, so partial streams bill what was produced.
pub(crate) async fn pump_stream(
    response: UpstreamResponse,
    sink: &mut dyn ClientSink,
    mut tracker: UsageTracker,
    mut reframer: Reframer,
) -> Result<Option<Usage>, RelayError> {
    sink.begin_stream(sse_head())
        .await
        .map_err(|err| RelayError::response_failed(err.to_string()))?;

    let mut decoder = PayloadDecoder::new();

    fn collect_frames(
        payloads: Vec<String>,
        tracker: &mut UsageTracker,
        reframer: &mut Reframer,
    ) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for payload in payloads {
            if payload.is_empty() {
                continue;
            }
            tracker.observe(&payload);
            frames.extend(reframer.push(&payload));
        }
        frames
    }

    match response.body {
        UpstreamBody::Buffered(bytes) => {
            let frames = collect_frames(decoder.feed(&bytes), &mut tracker, &mut reframer);
            for frame in frames {
                if sink.write_frame(frame).await.is_err() {
                    return Err(disconnected(&tracker));
                }
            }
        }
        UpstreamBody::Streaming(mut stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        return Err(RelayError::ResponseFailed {
                            message: format!("upstream read failed: {err}"),
                            usage_so_far: tracker.current(),
                        });
                    }
                };
                let frames = collect_frames(decoder.feed(&chunk), &mut tracker, &mut reframer);
                for frame in frames {
                    if sink.write_frame(frame).await.is_err() {
                        return Err(disconnected(&tracker));
                    }
                }
            }
        }
    }

    let mut frames = collect_frames(decoder.finish(), &mut tracker, &mut reframer);
    frames.extend(reframer.finish());
    for frame in frames {
        if sink.write_frame(frame).await.is_err() {
            return Err(disconnected(&tracker));
        }
    }
    Ok(tracker.current())
}

fn disconnected(tracker: &UsageTracker) -> RelayError {
    RelayError::ResponseFailed {
        message: "client disconnected".to_string(),
        usage_so_far: tracker.current(),
    }
}

/// Buffered (non-stream) counterpart: parse the upstream document, convert
/// it to the inbound dialect, write it, and report usage.
pub(crate) async fn forward_document(
    upstream: UpstreamDialect,
    inbound: InboundDialect,
    model: &str,
    response: UpstreamResponse,
    sink: &mut dyn ClientSink,
) -> Result<Option<Usage>, RelayError> {
    let body = response
        .collect_body()
        .await
        .map_err(|err| RelayError::response_failed(err.to_string()))?;

    let (client_body, usage) = match upstream {
        UpstreamDialect::Claude => {
            let message = parse::<claude::MessageResponse>(&body)?;
            let usage = usage_from_claude(&message.usage);
            let client_body = match inbound {
                InboundDialect::Claude => body,
                InboundDialect::OpenAiChat => {
                    serialize(&chat_response_from_messages(&message))?
                }
            };
            (client_body, usage)
        }
        UpstreamDialect::OpenAiChat => {
            let chat = parse::<openai::ChatResponse>(&body)?;
            let usage = chat.usage.as_ref().map(usage_from_chat).unwrap_or_default();
            let client_body = match inbound {
                InboundDialect::OpenAiChat => body,
                InboundDialect::Claude => {
                    serialize(&messages_response_from_chat(&chat, model))?
                }
            };
            (client_body, usage)
        }
        UpstreamDialect::Gemini => {
            let gemini_response = parse::<gemini::GenerateContentResponse>(&body)?;
            let usage = gemini_response
                .usage_metadata
                .as_ref()
                .map(usage_from_gemini)
                .unwrap_or_default();
            let message = messages_response_from_gemini(&gemini_response, model);
            let client_body = match inbound {
                InboundDialect::Claude => serialize(&message)?,
                InboundDialect::OpenAiChat => {
                    serialize(&chat_response_from_messages(&message))?
                }
            };
            (client_body, usage)
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    sink.write_document(200, headers, client_body)
        .await
        .map_err(|err| RelayError::response_failed(err.to_string()))?;
    Ok((!usage.is_zero()).then_some(usage))
}

fn parse<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, RelayError> {
    serde_json::from_slice(body)
        .map_err(|err| RelayError::response_failed(format!("unparsable upstream response: {err}")))
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<Bytes, RelayError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| RelayError::response_failed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgate_relay::BufferSink;

    fn stream_response(frames: &str) -> UpstreamResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        UpstreamResponse {
            status: 200,
            headers,
            body: UpstreamBody::Buffered(Bytes::from(frames.to_string())),
        }
    }

    #[tokio::test]
    async fn claude_passthrough_keeps_event_names_and_usage() {
        let frames = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"m\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-3-5-sonnet-20241022\",\"usage\":{\"input_tokens\":7,\"output_tokens\":1}}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let mut sink = BufferSink::new();
        let usage = pump_stream(
            stream_response(frames),
            &mut sink,
            UsageTracker::new(UpstreamDialect::Claude),
            Reframer::ClaudePassthrough,
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 10);
        let body = sink.body_string();
        assert!(body.contains("event: message_start"));
        assert!(body.contains("event: message_stop"));
    }

    #[tokio::test]
    async fn openai_upstream_reframes_for_claude_inbound() {
        let frames = concat!(
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"hi\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3,\"total_tokens\":10}}\n\n",
            "data: [DONE]\n\n",
        );
        let mut sink = BufferSink::new();
        let usage = pump_stream(
            stream_response(frames),
            &mut sink,
            UsageTracker::new(UpstreamDialect::OpenAiChat),
            Reframer::new(
                UpstreamDialect::OpenAiChat,
                InboundDialect::Claude,
                "claude-3-5-sonnet-20241022",
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(usage.total_tokens, 10);
        let body = sink.body_string();
        assert!(body.contains("event: message_start"));
        assert!(body.contains("event: content_block_delta"));
        assert!(body.contains("event: message_stop"));
        assert!(!body.contains("[DONE]"));
    }

    #[tokio::test]
    async fn claude_upstream_reframes_for_openai_inbound_with_done() {
        let frames = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"m\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-3-5-sonnet-20241022\",\"usage\":{\"input_tokens\":7,\"output_tokens\":1}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hey\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
        );
        let mut sink = BufferSink::new();
        pump_stream(
            stream_response(frames),
            &mut sink,
            UsageTracker::new(UpstreamDialect::Claude),
            Reframer::new(
                UpstreamDialect::Claude,
                InboundDialect::OpenAiChat,
                "claude-3-5-sonnet-20241022",
            ),
        )
        .await
        .unwrap();

        let body = sink.body_string();
        assert!(body.contains("chat.completion.chunk"));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn disconnect_mid_stream_reports_usage_so_far() {
        let frames = concat!(
            "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2,\"total_tokens\":9}}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"b\"}}]}\n\n",
        );
        let mut sink = BufferSink::new();
        sink.disconnect_after = Some(1);
        let error = pump_stream(
            stream_response(frames),
            &mut sink,
            UsageTracker::new(UpstreamDialect::OpenAiChat),
            Reframer::OpenAiPassthrough,
        )
        .await
        .unwrap_err();

        match error {
            RelayError::ResponseFailed { usage_so_far, .. } => {
                assert_eq!(usage_so_far.unwrap().total_tokens, 9);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn buffered_openai_document_converts_for_claude_inbound() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        })
        .to_string();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = UpstreamResponse {
            status: 200,
            headers,
            body: UpstreamBody::Buffered(Bytes::from(body)),
        };

        let mut sink = BufferSink::new();
        let usage = forward_document(
            UpstreamDialect::OpenAiChat,
            InboundDialect::Claude,
            "claude-3-5-sonnet-20241022",
            response,
            &mut sink,
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(usage.total_tokens, 10);
        let written: serde_json::Value = serde_json::from_str(&sink.body_string()).unwrap();
        assert_eq!(written["type"], "message");
        assert_eq!(written["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(written["usage"]["input_tokens"], 7);
    }
}
