//! End-to-end pipeline tests over a scripted adapter and an in-memory
//! ledger; no network IO anywhere.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde_json::json;

use qgate_common::RelaySettings;
use qgate_protocol::claude;
use qgate_protocol::sse::encode_frame;
use qgate_relay::{
    AdapterRegistry, ApiType, BufferSink, Channel, ChannelAdapter, ClientSink, InboundRequest,
    MemoryLedger, PriceTable, PricingOracle, QuotaLedger, Relay, RelayDeps, RelayError, RelayInfo,
    RelayMode, StreamHead, TokenCounter, UpstreamBody, UpstreamResponse, Usage, UsageRecord,
    UsageSink,
};

struct FixedCounter(u64);

impl TokenCounter for FixedCounter {
    fn count(&self, _inbound: &InboundRequest, _model: &str) -> Result<u64, RelayError> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageSink for RecordingSink {
    fn record(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// What the scripted adapter should do per stage.
struct Script {
    convert_error: Option<String>,
    response_status: u16,
    response_content_type: &'static str,
    response_body: String,
    stream_events: Vec<claude::StreamEvent>,
    stream_usage: Option<Usage>,
    usage_on_cancel: Option<Usage>,
    captured_request: Mutex<Option<claude::MessagesRequest>>,
    captured_stream_flag: Mutex<Option<bool>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            convert_error: None,
            response_status: 200,
            response_content_type: "application/json",
            response_body: String::new(),
            stream_events: Vec::new(),
            stream_usage: None,
            usage_on_cancel: None,
            captured_request: Mutex::new(None),
            captured_stream_flag: Mutex::new(None),
        }
    }
}

struct ScriptedAdapter {
    script: Arc<Script>,
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn init(&mut self, _info: &RelayInfo) -> Result<(), RelayError> {
        Ok(())
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        Ok(format!("{}/v1/messages", info.base_url))
    }

    async fn setup_request_headers(
        &self,
        _info: &RelayInfo,
        _headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        Ok(())
    }

    fn convert_request(
        &self,
        _info: &mut RelayInfo,
        inbound: &InboundRequest,
    ) -> Result<Bytes, RelayError> {
        if let Some(message) = self.script.convert_error.as_ref() {
            return Err(RelayError::ConvertFailed(message.clone()));
        }
        let InboundRequest::ClaudeMessages(request) = inbound else {
            return Err(RelayError::ConvertFailed("unsupported dialect".into()));
        };
        *self.script.captured_request.lock().unwrap() = Some(request.clone());
        serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|err| RelayError::ConvertFailed(err.to_string()))
    }

    async fn do_request(
        &self,
        _info: &RelayInfo,
        _payload: Bytes,
    ) -> Result<UpstreamResponse, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            self.script.response_content_type.parse().unwrap(),
        );
        Ok(UpstreamResponse {
            status: self.script.response_status,
            headers,
            body: UpstreamBody::Buffered(Bytes::from(self.script.response_body.clone())),
        })
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: UpstreamResponse,
        sink: &mut dyn ClientSink,
    ) -> Result<Option<Usage>, RelayError> {
        *self.script.captured_stream_flag.lock().unwrap() = Some(info.is_stream());
        if info.is_stream() {
            sink.begin_stream(StreamHead {
                status: 200,
                headers: response.headers,
            })
            .await
            .map_err(|err| RelayError::response_failed(err.to_string()))?;
            for event in &self.script.stream_events {
                let data = serde_json::to_string(event).unwrap();
                let frame = encode_frame(Some(event.event_name()), &data);
                if sink.write_frame(frame).await.is_err() {
                    return Err(RelayError::ResponseFailed {
                        message: "client disconnected".to_string(),
                        usage_so_far: self.script.usage_on_cancel,
                    });
                }
            }
            Ok(self.script.stream_usage)
        } else {
            let body = response
                .collect_body()
                .await
                .map_err(|err| RelayError::response_failed(err.to_string()))?;
            let usage = serde_json::from_slice::<claude::MessageResponse>(&body)
                .ok()
                .map(|message| {
                    Usage::new(message.usage.input_tokens, message.usage.output_tokens)
                });
            sink.write_document(200, HeaderMap::new(), body)
                .await
                .map_err(|err| RelayError::response_failed(err.to_string()))?;
            Ok(usage)
        }
    }

    fn model_list(&self) -> Vec<&'static str> {
        vec!["claude-3-5-sonnet-20241022"]
    }

    fn channel_name(&self) -> &'static str {
        "scripted"
    }
}

struct Fixture {
    relay: Relay,
    ledger: Arc<MemoryLedger>,
    usage_sink: Arc<RecordingSink>,
    script: Arc<Script>,
    channel: Channel,
}

fn fixture(script: Script) -> Fixture {
    fixture_with(script, 7, json!({}))
}

fn fixture_with(script: Script, counted_tokens: u64, channel_extra: serde_json::Value) -> Fixture {
    let script = Arc::new(script);
    let ledger = Arc::new(MemoryLedger::new());
    let usage_sink = Arc::new(RecordingSink::default());

    let mut registry = AdapterRegistry::new();
    let factory_script = script.clone();
    registry.register(ApiType::Anthropic, move || {
        Box::new(ScriptedAdapter {
            script: factory_script.clone(),
        })
    });

    let price_table: PriceTable = serde_json::from_value(json!({
        "models": {
            "claude-3-5-sonnet-20241022": {"model_ratio": 1.0, "completion_ratio": 1.0},
            "claude-sonnet-4-20250514": {"model_ratio": 1.0, "completion_ratio": 1.0}
        },
        "groups": {"default": 1.0}
    }))
    .unwrap();

    let mut channel_value = json!({
        "id": 7,
        "name": "primary",
        "api_type": "anthropic",
        "base_url": "https://api.anthropic.com",
        "api_key": "sk-test",
    });
    if let (Some(base), Some(extra)) = (channel_value.as_object_mut(), channel_extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    let channel: Channel = serde_json::from_value(channel_value).unwrap();

    let relay = Relay::new(RelayDeps {
        settings: Arc::new(ArcSwap::from_pointee(RelaySettings::default())),
        counter: Arc::new(FixedCounter(counted_tokens)),
        pricing: Arc::new(PricingOracle::new(price_table)),
        ledger: ledger.clone(),
        registry: Arc::new(registry),
        usage_sink: usage_sink.clone(),
    });

    Fixture {
        relay,
        ledger,
        usage_sink,
        script,
        channel,
    }
}

fn claude_inbound(model: &str, max_tokens: u32, stream: bool) -> InboundRequest {
    InboundRequest::ClaudeMessages(claude::MessagesRequest {
        model: model.to_string(),
        messages: vec![claude::Message {
            role: claude::Role::User,
            content: claude::MessageContent::Text("hi".to_string()),
        }],
        max_tokens,
        system: None,
        stream: stream.then_some(true),
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

fn relay_info(fixture: &Fixture, model: &str) -> RelayInfo {
    RelayInfo::new(
        1,
        10,
        fixture.channel.id,
        ApiType::Anthropic,
        RelayMode::ClaudeMessages,
        model,
        &fixture.channel.base_url,
        &fixture.channel.api_key,
        "trace-test",
    )
}

fn message_body(prompt: u64, completion: u64) -> String {
    json!({
        "id": "msg_01",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": "hello"}],
        "model": "claude-3-5-sonnet-20241022",
        "stop_reason": "end_turn",
        "usage": {"input_tokens": prompt, "output_tokens": completion}
    })
    .to_string()
}

#[tokio::test]
async fn happy_non_stream_settles_measured_usage() {
    let fixture = fixture(Script {
        response_body: message_body(7, 3),
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 1_000_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 0, false),
            &mut sink,
        )
        .await
        .unwrap();

    // Pre-reserve = 7 + default 4096 = 4103; actual = 10.
    assert_eq!(fixture.ledger.balance(1).await, Some(999_990));
    assert_eq!(sink.head.as_ref().unwrap().status, 200);
    let records = fixture.usage_sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].quota, 10);
    assert_eq!(records[0].usage.total_tokens, 10);
    // Zero max_tokens was replaced by the default before conversion.
    let captured = fixture.script.captured_request.lock().unwrap();
    assert_eq!(captured.as_ref().unwrap().max_tokens, 4096);
}

#[tokio::test]
async fn upstream_event_stream_promotes_is_stream() {
    let events = vec![
        claude::StreamEvent::MessageDelta {
            delta: claude::MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                stop_sequence: None,
            },
            usage: Some(claude::Usage {
                input_tokens: 7,
                output_tokens: 3,
                ..Default::default()
            }),
        },
        claude::StreamEvent::MessageStop,
    ];
    let fixture = fixture(Script {
        response_content_type: "text/event-stream",
        stream_events: events,
        stream_usage: Some(Usage::new(7, 3)),
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 1_000_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    // Client did not ask for a stream; the upstream content type promotes it.
    fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 100, false),
            &mut sink,
        )
        .await
        .unwrap();

    assert_eq!(
        *fixture.script.captured_stream_flag.lock().unwrap(),
        Some(true)
    );
    assert_eq!(sink.frames.len(), 2);
    assert!(sink.body_string().contains("event: message_delta"));
    // Settlement still ran: 7 + 3 consumed out of reserve 7 + 100.
    assert_eq!(fixture.ledger.balance(1).await, Some(999_990));
}

#[tokio::test]
async fn upstream_429_is_remapped_and_fully_refunded() {
    let fixture = fixture_with(
        Script {
            response_status: 429,
            response_body: json!({"error": {"message": "rate limited", "type": "rate_limit_error"}})
                .to_string(),
            ..Default::default()
        },
        7,
        json!({"status_code_mapping": "{\"429\":\"503\"}"}),
    );
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    let error = fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 100, false),
            &mut sink,
        )
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::UpstreamStructured { .. }));
    assert_eq!(error.status_code(), 503);
    assert!(!error.is_local());
    // Failure path: balance delta is zero.
    assert_eq!(fixture.ledger.balance(1).await, Some(10_000));
    assert!(sink.head.is_none());
}

#[tokio::test]
async fn client_cancel_without_usage_refunds_everything() {
    let events: Vec<claude::StreamEvent> = (0..5usize)
        .map(|index| claude::StreamEvent::ContentBlockDelta {
            index,
            delta: claude::BlockDelta::TextDelta {
                text: "chunk".to_string(),
            },
        })
        .collect();
    let fixture = fixture(Script {
        response_content_type: "text/event-stream",
        stream_events: events,
        usage_on_cancel: None,
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    sink.disconnect_after = Some(2);
    let model = "claude-3-5-sonnet-20241022";
    let error = fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 100, true),
            &mut sink,
        )
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        RelayError::ResponseFailed { usage_so_far: None, .. }
    ));
    assert_eq!(sink.frames.len(), 2);
    assert_eq!(fixture.ledger.balance(1).await, Some(10_000));
}

#[tokio::test]
async fn client_cancel_with_partial_usage_bills_it() {
    let events: Vec<claude::StreamEvent> = (0..5usize)
        .map(|index| claude::StreamEvent::ContentBlockDelta {
            index,
            delta: claude::BlockDelta::TextDelta {
                text: "chunk".to_string(),
            },
        })
        .collect();
    let fixture = fixture(Script {
        response_content_type: "text/event-stream",
        stream_events: events,
        usage_on_cancel: Some(Usage::new(7, 2)),
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    sink.disconnect_after = Some(2);
    let model = "claude-3-5-sonnet-20241022";
    let error = fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 100, true),
            &mut sink,
        )
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::ResponseFailed { .. }));
    // Billed the 9 tokens the stream had produced before the disconnect.
    assert_eq!(fixture.ledger.balance(1).await, Some(9_991));
}

#[tokio::test]
async fn convert_failure_is_local_and_refunds() {
    let fixture = fixture(Script {
        convert_error: Some("service account JSON lacks project_id".to_string()),
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    let error = fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 100, false),
            &mut sink,
        )
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::ConvertFailed(_)));
    assert!(error.is_local());
    assert_eq!(fixture.ledger.balance(1).await, Some(10_000));
}

#[tokio::test]
async fn thinking_suffix_transforms_the_upstream_request() {
    let fixture = fixture(Script {
        response_body: message_body(7, 3),
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 1_000_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-sonnet-4-20250514-thinking";
    fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 500, false),
            &mut sink,
        )
        .await
        .unwrap();

    let captured = fixture.script.captured_request.lock().unwrap();
    let request = captured.as_ref().unwrap();
    assert_eq!(request.model, "claude-sonnet-4-20250514");
    assert_eq!(request.max_tokens, 1280);
    let thinking = request.thinking.as_ref().unwrap();
    assert_eq!(thinking.kind, "enabled");
    assert_eq!(thinking.budget_tokens, Some(1024));
    assert_eq!(request.temperature, Some(1.0));
    assert!(request.top_p.is_none());
}

#[tokio::test]
async fn absent_usage_settles_the_counted_prompt() {
    // Response body that parses but carries zero usage.
    let fixture = fixture(Script {
        response_body: message_body(0, 0),
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 100, false),
            &mut sink,
        )
        .await
        .unwrap();

    // Billed {prompt = counted 7, completion = 0}.
    assert_eq!(fixture.ledger.balance(1).await, Some(9_993));
    let records = fixture.usage_sink.records.lock().unwrap();
    assert_eq!(records[0].usage.prompt_tokens, 7);
    assert_eq!(records[0].usage.completion_tokens, 0);
}

#[tokio::test]
async fn insufficient_quota_rejects_before_upstream() {
    let fixture = fixture(Script::default());
    fixture.ledger.credit_user(1, 50).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    let error = fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 4096, false),
            &mut sink,
        )
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::QuotaInsufficient { .. }));
    assert!(error.is_local());
    assert_eq!(fixture.ledger.balance(1).await, Some(50));
    // The adapter was never reached.
    assert!(fixture.script.captured_request.lock().unwrap().is_none());
}

#[tokio::test]
async fn empty_messages_rejected_without_side_effects() {
    let fixture = fixture(Script::default());
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    let inbound = InboundRequest::ClaudeMessages(claude::MessagesRequest {
        model: "claude-3-5-sonnet-20241022".to_string(),
        messages: vec![],
        max_tokens: 10,
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
    });
    let error = fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, "claude-3-5-sonnet-20241022"),
            inbound,
            &mut sink,
        )
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::InvalidRequest(_)));
    assert_eq!(fixture.ledger.balance(1).await, Some(10_000));
}

#[tokio::test]
async fn unregistered_api_type_refunds_and_rejects() {
    let fixture = fixture(Script::default());
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    let mut info = relay_info(&fixture, model);
    info.api_type = ApiType::Vertex; // nothing registered under it here
    let error = fixture
        .relay
        .relay(&fixture.channel, info, claude_inbound(model, 100, false), &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::InvalidApiType));
    assert!(error.is_local());
    assert_eq!(fixture.ledger.balance(1).await, Some(10_000));
}

#[tokio::test]
async fn reported_prompt_below_count_is_raised_to_it() {
    let fixture = fixture(Script {
        response_body: message_body(4, 3),
        ..Default::default()
    });
    fixture.ledger.credit_user(1, 10_000).await;

    let mut sink = BufferSink::new();
    let model = "claude-3-5-sonnet-20241022";
    fixture
        .relay
        .relay(
            &fixture.channel,
            relay_info(&fixture, model),
            claude_inbound(model, 100, false),
            &mut sink,
        )
        .await
        .unwrap();

    let records = fixture.usage_sink.records.lock().unwrap();
    // Counter said 7; upstream reported 4. Billing floors at the count.
    assert_eq!(records[0].usage.prompt_tokens, 7);
    assert_eq!(records[0].quota, 10);
}
