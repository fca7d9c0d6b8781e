use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use qgate_protocol::{claude, openai};
use qgate_relay::{HttpSink, InboundRequest, RelayError, RelayInfo, RelayMode, StreamHead};

use crate::state::AppState;

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(claude_messages))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

async fn claude_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<claude::MessagesRequest>,
) -> Response {
    relay_inbound(
        state,
        headers,
        InboundRequest::ClaudeMessages(request),
        RelayMode::ClaudeMessages,
    )
    .await
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<openai::ChatRequest>,
) -> Response {
    relay_inbound(
        state,
        headers,
        InboundRequest::ChatCompletions(request),
        RelayMode::Chat,
    )
    .await
}

async fn relay_inbound(
    state: Arc<AppState>,
    headers: HeaderMap,
    inbound: InboundRequest,
    mode: RelayMode,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let Some(key) = bearer_key(&headers) else {
        return error_response(
            &RelayError::InvalidRequest("missing api key".to_string()),
            mode,
            Some(401),
        );
    };
    let Some(authed) = state.authenticate(&key) else {
        return error_response(
            &RelayError::InvalidRequest("invalid api key".to_string()),
            mode,
            Some(401),
        );
    };
    let Some(channel) = state.select_channel(inbound.model()) else {
        return error_response(
            &RelayError::InvalidRequest(format!(
                "no channel serves model {:?}",
                inbound.model()
            )),
            mode,
            Some(503),
        );
    };
    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        user_id = authed.user_id,
        channel = %channel.name,
        model = %inbound.model(),
    );

    let mut info = RelayInfo::new(
        authed.user_id,
        authed.key_id,
        channel.id,
        channel.api_type,
        mode,
        inbound.model(),
        &channel.base_url,
        &channel.api_key,
        trace_id,
    );
    info.api_version = channel.api_version.clone();
    info.group = authed.group;

    let (mut sink, head_rx, frame_rx) = HttpSink::new();
    let (error_tx, error_rx) = tokio::sync::oneshot::channel::<RelayError>();
    tokio::spawn(async move {
        if let Err(error) = state.relay.relay(&channel, info, inbound, &mut sink).await {
            let _ = error_tx.send(error);
        }
    });

    match head_rx.await {
        Ok((head, Some(body))) => document_response(head, body),
        Ok((head, None)) => stream_response(head, frame_rx),
        // The sink was dropped before any write: the relay failed first.
        Err(_) => match error_rx.await {
            Ok(error) => error_response(&error, mode, None),
            Err(_) => {
                warn!(event = "relay_vanished");
                error_response(
                    &RelayError::response_failed("relay task ended without a response"),
                    mode,
                    None,
                )
            }
        },
    }
}

fn bearer_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key") {
        return value.to_str().ok().map(str::to_string);
    }
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    Some(value.strip_prefix("Bearer ").unwrap_or(value).to_string())
}

fn document_response(head: StreamHead, body: bytes::Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() =
        StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().extend(head.headers);
    response
}

fn stream_response(
    head: StreamHead,
    frames: tokio::sync::mpsc::Receiver<bytes::Bytes>,
) -> Response {
    let stream = ReceiverStream::new(frames).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() =
        StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().extend(head.headers);
    response
}

fn error_response(error: &RelayError, mode: RelayMode, status_override: Option<u16>) -> Response {
    let status = status_override.unwrap_or_else(|| error.status_code());
    let body = match mode {
        RelayMode::ClaudeMessages => error.to_claude_body(),
        _ => error.to_openai_body(),
    };
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}
