//! Native Anthropic messages backend.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};

use qgate_relay::{
    ChannelAdapter, ClientSink, InboundRequest, RelayError, RelayInfo, UpstreamResponse, Usage,
};

use crate::client::post_json;
use crate::streaming::{forward_document, pump_stream, Reframer, UpstreamDialect, UsageTracker};
use crate::translate::claude_openai::messages_request_from_chat;
use crate::util::inbound_dialect;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_API_VERSION: &str = "2023-06-01";

const MODEL_LIST: &[&str] = &[
    "claude-3-5-haiku-20241022",
    "claude-3-5-sonnet-20241022",
    "claude-3-7-sonnet-20250219",
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
];

#[derive(Default)]
pub struct AnthropicAdapter;

#[async_trait]
impl ChannelAdapter for AnthropicAdapter {
    fn init(&mut self, _info: &RelayInfo) -> Result<(), RelayError> {
        Ok(())
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        let base = if info.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            info.base_url.trim_end_matches('/')
        };
        Ok(format!("{base}/v1/messages"))
    }

    async fn setup_request_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&info.api_key)
                .map_err(|err| RelayError::ConvertFailed(err.to_string()))?,
        );
        let version = info.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(version)
                .map_err(|err| RelayError::ConvertFailed(err.to_string()))?,
        );
        Ok(())
    }

    fn convert_request(
        &self,
        info: &mut RelayInfo,
        inbound: &InboundRequest,
    ) -> Result<Bytes, RelayError> {
        let request = match inbound {
            InboundRequest::ClaudeMessages(request) => request.clone(),
            InboundRequest::ChatCompletions(request) => messages_request_from_chat(request),
        };
        info.set_override("request_model", request.model.clone());
        serde_json::to_vec(&request)
            .map(Bytes::from)
            .map_err(|err| RelayError::ConvertFailed(err.to_string()))
    }

    async fn do_request(
        &self,
        info: &RelayInfo,
        payload: Bytes,
    ) -> Result<UpstreamResponse, RelayError> {
        let url = self.request_url(info)?;
        let mut headers = HeaderMap::new();
        self.setup_request_headers(info, &mut headers).await?;
        post_json(info, &url, headers, payload).await
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: UpstreamResponse,
        sink: &mut dyn ClientSink,
    ) -> Result<Option<Usage>, RelayError> {
        let inbound = inbound_dialect(info);
        if info.is_stream() {
            pump_stream(
                response,
                sink,
                UsageTracker::new(UpstreamDialect::Claude),
                Reframer::new(UpstreamDialect::Claude, inbound, &info.origin_model_name),
            )
            .await
        } else {
            forward_document(
                UpstreamDialect::Claude,
                inbound,
                &info.origin_model_name,
                response,
                sink,
            )
            .await
        }
    }

    fn model_list(&self) -> Vec<&'static str> {
        MODEL_LIST.to_vec()
    }

    fn channel_name(&self) -> &'static str {
        "anthropic"
    }
}
