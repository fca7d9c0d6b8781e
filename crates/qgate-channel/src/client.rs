use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures_util::StreamExt;
use http::HeaderMap;

use qgate_relay::{scrub_transport_message, RelayError, RelayInfo, UpstreamBody, UpstreamResponse};

static SHARED_CLIENT: OnceLock<Arc<wreq::Client>> = OnceLock::new();

pub(crate) fn shared_client() -> Result<Arc<wreq::Client>, RelayError> {
    if let Some(client) = SHARED_CLIENT.get() {
        return Ok(client.clone());
    }
    let client = wreq::Client::builder()
        .build()
        .map_err(|err| transport_error(&err.to_string()))?;
    Ok(SHARED_CLIENT.get_or_init(|| Arc::new(client)).clone())
}

pub(crate) fn transport_error(message: &str) -> RelayError {
    RelayError::UpstreamTransport(scrub_transport_message(message))
}

/// POST the payload and hand back a response handle whose body stays
/// streaming; error paths and buffered handlers drain it on demand.
pub(crate) async fn post_json(
    info: &RelayInfo,
    url: &str,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<UpstreamResponse, RelayError> {
    let client = shared_client()?;
    tracing::debug!(
        event = "upstream_send",
        trace_id = %info.trace_id,
        model = %info.upstream_model_name,
        bytes = payload.len(),
    );
    let response = client
        .post(url)
        .headers(headers)
        .body(payload)
        .send()
        .await
        .map_err(|err| transport_error(&err.to_string()))?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let stream = response
        .bytes_stream()
        .map(|item| item.map_err(|err| std::io::Error::other(err.to_string())));
    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Streaming(Box::pin(stream)),
    })
}
