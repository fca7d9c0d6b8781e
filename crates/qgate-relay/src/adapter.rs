use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::info::{ApiType, InboundRequest, RelayInfo};
use crate::sink::ClientSink;

/// Post-hoc report of tokens consumed, produced by the adapter from the
/// upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cached_input_tokens: None,
            reasoning_tokens: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub enum UpstreamBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            UpstreamBody::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

/// Handle over the upstream HTTP response, decoupled from any client crate
/// so tests can fabricate responses.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> &str {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type().starts_with("text/event-stream")
    }

    /// Buffer the remaining body. Used on error paths where the full payload
    /// is needed for normalization.
    pub async fn collect_body(self) -> Result<Bytes, std::io::Error> {
        use futures_util::StreamExt;
        match self.body {
            UpstreamBody::Buffered(bytes) => Ok(bytes),
            UpstreamBody::Streaming(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

/// The capability set every outbound channel family satisfies.
///
/// Instances are created per request by the registry, see `init`; they are
/// discarded after `do_response`. Implementations must not perform IO
/// anywhere except `setup_request_headers` (credential exchange) and
/// `do_request`/`do_response`.
#[async_trait]
pub trait ChannelAdapter: Send {
    /// Pre-request setup: derive the request mode for umbrella backends,
    /// parse credential material out of `info.api_key`. No IO.
    fn init(&mut self, info: &RelayInfo) -> Result<(), RelayError>;

    /// Pure function of `info`; honors model→region maps and stream vs
    /// non-stream URL forms.
    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError>;

    /// May perform side-effectful credential exchange (token refresh,
    /// request signing). Sets `Authorization` where the backend requires it.
    async fn setup_request_headers(
        &self,
        info: &RelayInfo,
        headers: &mut HeaderMap,
    ) -> Result<(), RelayError>;

    /// Translate the inbound dialect into the provider dialect. The returned
    /// payload is opaque to the pipeline; only this adapter interprets it.
    fn convert_request(
        &self,
        info: &mut RelayInfo,
        inbound: &InboundRequest,
    ) -> Result<Bytes, RelayError>;

    /// Issue the HTTP call (URL from `request_url`, headers from
    /// `setup_request_headers`). Honors cancellation via task abort.
    async fn do_request(
        &self,
        info: &RelayInfo,
        payload: Bytes,
    ) -> Result<UpstreamResponse, RelayError>;

    /// Stream or buffer depending on `info.is_stream()`: streaming writes
    /// re-framed SSE to the sink as frames arrive and accumulates usage from
    /// the terminal event; buffered transforms one JSON document.
    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: UpstreamResponse,
        sink: &mut dyn ClientSink,
    ) -> Result<Option<Usage>, RelayError>;

    /// Models this family advertises; administrative surfaces only.
    fn model_list(&self) -> Vec<&'static str>;

    /// Stable identifier for logs and configuration.
    fn channel_name(&self) -> &'static str;
}

pub type AdapterFactory = Box<dyn Fn() -> Box<dyn ChannelAdapter> + Send + Sync>;

/// Maps an [`ApiType`] to a fresh adapter instance per request.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<ApiType, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, api_type: ApiType, factory: F)
    where
        F: Fn() -> Box<dyn ChannelAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(api_type, Box::new(factory));
    }

    pub fn create(&self, api_type: ApiType) -> Option<Box<dyn ChannelAdapter>> {
        self.factories.get(&api_type).map(|factory| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_is_sum() {
        let usage = Usage::new(7, 3);
        assert_eq!(usage.total_tokens, 10);
        assert!(!usage.is_zero());
        assert!(Usage::default().is_zero());
    }

    #[test]
    fn upstream_response_detects_event_stream() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            "text/event-stream; charset=utf-8".parse().unwrap(),
        );
        let response = UpstreamResponse {
            status: 200,
            headers,
            body: UpstreamBody::Buffered(Bytes::new()),
        };
        assert!(response.is_event_stream());
    }

    #[tokio::test]
    async fn collect_body_drains_stream() {
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let response = UpstreamResponse {
            status: 500,
            headers: HeaderMap::new(),
            body: UpstreamBody::Streaming(Box::pin(futures_util::stream::iter(chunks))),
        };
        assert_eq!(&response.collect_body().await.unwrap()[..], b"abcd");
    }
}
