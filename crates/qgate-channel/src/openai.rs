//! OpenAI-compatible chat-completions backend.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};

use qgate_protocol::openai::StreamOptions;
use qgate_relay::{
    ChannelAdapter, ClientSink, InboundRequest, RelayError, RelayInfo, UpstreamResponse, Usage,
};

use crate::client::post_json;
use crate::streaming::{forward_document, pump_stream, Reframer, UpstreamDialect, UsageTracker};
use crate::translate::claude_openai::chat_request_from_messages;
use crate::util::inbound_dialect;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const MODEL_LIST: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4.1", "o3", "o4-mini"];

#[derive(Default)]
pub struct OpenAiAdapter;

#[async_trait]
impl ChannelAdapter for OpenAiAdapter {
    fn init(&mut self, _info: &RelayInfo) -> Result<(), RelayError> {
        Ok(())
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        let base = if info.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            info.base_url.trim_end_matches('/')
        };
        Ok(format!("{base}/v1/chat/completions"))
    }

    async fn setup_request_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError> {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", info.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|err| RelayError::ConvertFailed(err.to_string()))?,
        );
        Ok(())
    }

    fn convert_request(
        &self,
        info: &mut RelayInfo,
        inbound: &InboundRequest,
    ) -> Result<Bytes, RelayError> {
        let mut request = match inbound {
            InboundRequest::ChatCompletions(request) => request.clone(),
            InboundRequest::ClaudeMessages(request) => chat_request_from_messages(request),
        };
        // The final usage frame only arrives when asked for.
        if info.is_stream() {
            request.stream = Some(true);
            let options = request.stream_options.get_or_insert_with(StreamOptions::default);
            if options.include_usage.is_none() {
                options.include_usage = Some(true);
            }
        }
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
                UsageTracker::new(UpstreamDialect::OpenAiChat),
                Reframer::new(
                    UpstreamDialect::OpenAiChat,
                    inbound,
                    &info.origin_model_name,
                ),
            )
            .await
        } else {
            forward_document(
                UpstreamDialect::OpenAiChat,
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
        "openai"
    }
}
