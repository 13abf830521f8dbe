//! Luthien proxy core: the streaming request/response pipeline.
//!
//! Accepts OpenAI- and Anthropic-shaped chat requests, normalizes them,
//! routes every message and streaming delta through the configured policy,
//! and delivers the result in the client's dialect with full event capture.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::StreamExt;

mod convert;
mod error;
pub mod messages;
mod observability;
mod orchestrator;
mod pipeline;
pub mod policies;
mod policy;
mod streaming;
mod upstream;

pub use error::{AnthropicErrorResponse, AnthropicResult, ProxyError, ProxyResult};
pub use messages::anthropic::MessagesRequest;
pub use messages::openai::ChatRequest;
pub use pipeline::{CompletionOutcome, CompletionReply, Dialect, Gateway};
pub use policy::Policy;
pub use policy::context::{PolicyContext, Scratchpad, StreamingPolicyContext};
pub use policy::manager::{PolicyInfo, PolicyManager};
pub use policy::simple::{BlockPolicy, SimplePolicy};
pub use streaming::ChunkStream;
pub use upstream::{Backend, backend_from_config};

use storage::{Database, EventBus, EventSink};

/// Heartbeat interval for activity SSE subscribers.
const ACTIVITY_HEARTBEAT: Duration = Duration::from_secs(15);

/// Build the gateway from configuration: storage connections, backend,
/// and the initial policy.
pub async fn build_gateway(config: config::Config) -> anyhow::Result<Arc<Gateway>> {
    let db = match &config.storage.database_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.migrate().await?;
            Some(db)
        }
        None => {
            log::warn!("no database configured; conversation events will not be persisted");
            None
        }
    };

    let bus = match &config.storage.redis_url {
        Some(url) => Some(EventBus::connect(url).await?),
        None => {
            log::warn!("no event bus configured; live activity streams are disabled");
            None
        }
    };

    let sink = EventSink::new(db.clone(), bus.clone());
    let backend = backend_from_config(&config.upstream).map_err(|error| anyhow::anyhow!("{error}"))?;
    let policies = Arc::new(PolicyManager::initialize(&config, db.clone(), bus.clone()).await?);

    Ok(Arc::new(Gateway::new(config, backend, policies, sink, db, bus)))
}

/// Creates the axum router for the control plane endpoints.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let max_body_bytes = gateway.config().server.max_body_bytes;

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/activity/stream", get(global_activity_stream))
        .route("/calls/{call_id}/stream", get(call_activity_stream))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(gateway)
}

/// Handle chat completion requests in the normalized dialect.
///
/// With `stream: true` the response is SSE with one `data: {json}` frame per
/// chunk and a terminating `data: [DONE]`; otherwise a JSON body.
async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Sonic(request): Sonic<ChatRequest>,
) -> ProxyResult<Response> {
    log::debug!(
        "chat completions for model {} ({} messages, streaming: {})",
        request.model,
        request.messages.len(),
        request.wants_stream()
    );

    let reply = gateway.handle_completion(&headers, request, Dialect::OpenAi).await?;
    Ok(into_response(reply))
}

/// Handle Anthropic messages requests.
///
/// The body converts to the normalized dialect before the policy runs; with
/// `stream: true` the response is the Anthropic SSE event sequence.
async fn anthropic_messages(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Sonic(request): Sonic<MessagesRequest>,
) -> AnthropicResult<Response> {
    log::debug!(
        "anthropic messages for model {} ({} messages, streaming: {})",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let normalized = convert::from_anthropic::chat_request_from_messages(request).map_err(AnthropicErrorResponse::from)?;

    let reply = gateway
        .handle_completion(&headers, normalized, Dialect::Anthropic)
        .await
        .map_err(AnthropicErrorResponse::from)?;

    Ok(into_response(reply))
}

fn into_response(reply: CompletionReply) -> Response {
    let call_id = HeaderValue::from_str(&reply.call_id).unwrap_or_else(|_| HeaderValue::from_static("invalid"));

    match reply.outcome {
        CompletionOutcome::Json(response) => {
            let mut response = axum::Json(response).into_response();
            response.headers_mut().insert("x-call-id", call_id);
            response
        }
        CompletionOutcome::AnthropicJson(response) => {
            let mut response = axum::Json(response).into_response();
            response.headers_mut().insert("x-call-id", call_id);
            response
        }
        CompletionOutcome::Stream(frames) => {
            let events = frames.map(|frame| Ok::<_, Infallible>(frame.into_sse_event()));

            let mut response = Sse::new(events).into_response();
            let headers = response.headers_mut();
            headers.insert("x-call-id", call_id);
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            response
        }
    }
}

/// SSE stream of every event on the global activity channel.
async fn global_activity_stream(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.bus() {
        Some(bus) => {
            let frames = bus.sse_frames(storage::global_activity_channel().to_string(), ACTIVITY_HEARTBEAT);
            raw_sse_response(frames)
        }
        None => bus_unavailable(),
    }
}

/// SSE stream of one call's events.
async fn call_activity_stream(State(gateway): State<Arc<Gateway>>, Path(call_id): Path<String>) -> Response {
    match gateway.bus() {
        Some(bus) => {
            let frames = bus.sse_frames(storage::conversation_channel(&call_id), ACTIVITY_HEARTBEAT);
            raw_sse_response(frames)
        }
        None => bus_unavailable(),
    }
}

/// The bus layer emits preformatted SSE text (data frames and `: ping`
/// heartbeats), so these endpoints stream it verbatim.
fn raw_sse_response(frames: impl futures::Stream<Item = String> + Send + 'static) -> Response {
    let body = Body::from_stream(frames.map(|frame| Ok::<_, Infallible>(frame.into_bytes())));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn bus_unavailable() -> Response {
    ProxyError::Overloaded("event bus is not configured".to_string()).into_response()
}
