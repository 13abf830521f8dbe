//! End-to-end pipeline scenarios against mock upstream servers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    http::header,
    response::IntoResponse,
    routing::post,
};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{Value, json};
use storage::{ConversationEvent, EventSink, event_types};
use tokio::net::TcpListener;

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    address
}

fn sse_body(frames: &[Value]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str(&format!("data: {frame}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn mock_upstream_json(response: Value) -> SocketAddr {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let response = response.clone();
            async move { Json(response) }
        }),
    );

    serve(app).await
}

async fn mock_upstream_sse(frames: Vec<Value>) -> SocketAddr {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let body = sse_body(&frames);
            async move { ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response() }
        }),
    );

    serve(app).await
}

/// Build a gateway with an in-memory event sink and serve its router.
async fn serve_proxy(config_yaml: String) -> (SocketAddr, Arc<std::sync::Mutex<Vec<ConversationEvent>>>) {
    let config = config::Config::from_yaml(&config_yaml).unwrap();

    let (sink, events) = EventSink::in_memory();
    let backend = proxy::backend_from_config(&config.upstream).unwrap();
    let policies = Arc::new(proxy::PolicyManager::initialize(&config, None, None).await.unwrap());

    let gateway = Arc::new(proxy::Gateway::new(config, backend, policies, sink, None, None));
    let address = serve(proxy::router(gateway)).await;

    (address, events)
}

fn base_config(upstream: SocketAddr, policy_class: &str, extra: &str) -> String {
    format!(
        "upstream:\n  kind: openai\n  base_url: \"http://{upstream}/v1\"\npolicy:\n  class: \"luthien.policies:{policy_class}\"\n  config: {{}}\n{extra}"
    )
}

/// `(event_name, data)` pairs from an SSE response, `[DONE]` included.
async fn collect_sse(response: reqwest::Response) -> Vec<(String, String)> {
    let mut stream = response.bytes_stream().eventsource();
    let mut events = Vec::new();

    while let Some(event) = stream.next().await {
        let event = event.unwrap();
        let done = event.data == "[DONE]";
        events.push((event.event.clone(), event.data.clone()));
        if done {
            break;
        }
    }

    events
}

#[tokio::test]
async fn noop_passthrough_non_streaming_returns_upstream_body() {
    let upstream_body = json!({
        "id": "r1",
        "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
        "model": "m"
    });

    let upstream = mock_upstream_json(upstream_body.clone()).await;
    let (address, _events) = serve_proxy(base_config(upstream, "NoOpPolicy", "")).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/chat/completions"))
        .json(&json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(!response.headers().get("x-call-id").unwrap().is_empty());

    let body: Value = response.json().await.unwrap();
    assert_eq!(body, upstream_body);
}

#[tokio::test]
async fn all_caps_streaming_uppercases_every_delta() {
    let frames = vec![
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"content": "he"}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"content": "ll"}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"content": "o"}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
    ];

    let upstream = mock_upstream_sse(frames).await;
    let (address, _events) = serve_proxy(base_config(upstream, "AllCapsPolicy", "")).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

    let events = collect_sse(response).await;
    assert_eq!(events.last().unwrap().1, "[DONE]");

    let mut content = String::new();
    let mut finish = None;
    for (_, data) in &events[..events.len() - 1] {
        let chunk: Value = serde_json::from_str(data).unwrap();
        if let Some(text) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(text);
        }
        if let Some(reason) = chunk["choices"][0]["finish_reason"].as_str() {
            finish = Some(reason.to_string());
        }
    }

    assert_eq!(content, "HELLO");
    assert_eq!(finish.as_deref(), Some("stop"));
}

#[tokio::test]
async fn anthropic_client_sees_complete_tool_call_event_sequence() {
    let frames = vec![
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "id": "call_1", "type": "function",
            "function": {"name": "search", "arguments": "{\"q\":\"t\"}"}
        }]}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
    ];

    let upstream = mock_upstream_sse(frames).await;
    let (address, _events) = serve_proxy(base_config(upstream, "NoOpPolicy", "")).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/messages"))
        .json(&json!({
            "model": "m",
            "max_tokens": 64,
            "stream": true,
            "messages": [{"role": "user", "content": "search for t"}],
            "tools": [{"name": "search", "input_schema": {"type": "object"}}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);

    let events = collect_sse(response).await;
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();

    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let start: Value = serde_json::from_str(&events[1].1).unwrap();
    assert_eq!(start["content_block"]["type"], "tool_use");
    assert_eq!(start["content_block"]["id"], "call_1");
    assert_eq!(start["content_block"]["name"], "search");

    let delta: Value = serde_json::from_str(&events[2].1).unwrap();
    assert_eq!(delta["delta"]["type"], "input_json_delta");
    assert_eq!(delta["delta"]["partial_json"], "{\"q\":\"t\"}");

    let message_delta: Value = serde_json::from_str(&events[4].1).unwrap();
    assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
}

#[tokio::test]
async fn tool_call_judge_blocks_flagged_tool_call() {
    // Judge that flags everything with probability 0.95.
    let judge_app = Router::new().route(
        "/chat/completions",
        post(|| async {
            Json(json!({
                "id": "j1",
                "model": "judge",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "{\"probability\": 0.95, \"explanation\": \"looks destructive\"}"
                    },
                    "finish_reason": "stop"
                }]
            }))
        }),
    );
    let judge = serve(judge_app).await;

    let frames = vec![
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "id": "call_1", "type": "function",
            "function": {"name": "delete_everything", "arguments": ""}
        }]}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "function": {"arguments": "{\"target\":\"prod\"}"}
        }]}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
    ];

    let upstream = mock_upstream_sse(frames).await;
    let judge_config = format!(
        "judge:\n  model: \"judge\"\n  base_url: \"http://{judge}\"\n  probability_threshold: 0.7\n"
    );
    let (address, _events) = serve_proxy(base_config(upstream, "ToolCallJudgePolicy", &judge_config)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "wipe prod"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    let events = collect_sse(response).await;

    let mut content = String::new();
    let mut finish = None;
    let mut saw_tool_calls = false;

    for (_, data) in &events[..events.len() - 1] {
        let chunk: Value = serde_json::from_str(data).unwrap();
        if let Some(text) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(text);
        }
        if chunk["choices"][0]["delta"]["tool_calls"].is_array() {
            saw_tool_calls = true;
        }
        if let Some(reason) = chunk["choices"][0]["finish_reason"].as_str() {
            finish = Some(reason.to_string());
        }
    }

    assert!(!saw_tool_calls, "blocked tool call leaked to the client");
    assert!(content.contains("blocked"), "expected explanation, got: {content}");
    assert!(content.contains("delete_everything"));
    assert_eq!(finish.as_deref(), Some("stop"));
}

#[tokio::test]
async fn string_replacement_preserves_anthropic_sse_completeness() {
    let frames = vec![
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"content": "he"}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"content": "llo"}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"content": " world"}}]}),
        json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
    ];

    let upstream = mock_upstream_sse(frames).await;
    let config = format!(
        "upstream:\n  kind: openai\n  base_url: \"http://{upstream}/v1\"\npolicy:\n  class: \"luthien.policies:StringReplacementPolicy\"\n  config:\n    replacements:\n      hello: goodbye\n"
    );
    let (address, _events) = serve_proxy(config).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/messages"))
        .json(&json!({
            "model": "m",
            "max_tokens": 64,
            "stream": true,
            "messages": [{"role": "user", "content": "say hello world"}]
        }))
        .send()
        .await
        .unwrap();

    let events = collect_sse(response).await;
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();

    assert_eq!(names.first().copied(), Some("message_start"));
    assert_eq!(names.last().copied(), Some("message_stop"));
    assert!(names.contains(&"content_block_start"));
    assert!(names.contains(&"content_block_stop"));
    assert!(names.contains(&"message_delta"));
    assert!(names.iter().filter(|name| **name == "content_block_delta").count() >= 1);

    let mut text = String::new();
    for (name, data) in &events {
        if name == "content_block_delta" {
            let event: Value = serde_json::from_str(data).unwrap();
            if let Some(fragment) = event["delta"]["text"].as_str() {
                text.push_str(fragment);
            }
        }
    }

    assert_eq!(text, "goodbye world");
}

#[tokio::test]
async fn overflowing_stream_truncates_recording_but_not_delivery() {
    let cap = 8;
    let total = cap * 10;

    let mut frames: Vec<Value> = (0..total)
        .map(|i| json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {"content": format!("{i} ")}}]}))
        .collect();
    frames.push(json!({"id": "r1", "model": "m", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
    let delivered = frames.len();

    let upstream = mock_upstream_sse(frames).await;
    let extra = format!("stream:\n  chunk_buffer_cap: {cap}\n");
    let (address, events) = serve_proxy(base_config(upstream, "NoOpPolicy", &extra)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/chat/completions"))
        .json(&json!({"model": "m", "messages": [{"role": "user", "content": "go"}], "stream": true}))
        .send()
        .await
        .unwrap();

    let sse = collect_sse(response).await;
    // Every chunk still reaches the client, plus the [DONE] marker.
    assert_eq!(sse.len(), delivered + 1);

    let events = events.lock().unwrap();

    let truncations: Vec<_> = events
        .iter()
        .filter(|event| event.event_type == event_types::CHUNKS_TRUNCATED)
        .collect();
    assert_eq!(truncations.len(), 2, "one truncation per direction");

    let directions: Vec<&str> = truncations
        .iter()
        .map(|event| event.payload["direction"].as_str().unwrap())
        .collect();
    assert!(directions.contains(&"ingress"));
    assert!(directions.contains(&"egress"));
    for truncation in &truncations {
        assert_eq!(truncation.payload["reason"], "max_chunks_queued_exceeded");
    }

    let summary = events
        .iter()
        .find(|event| event.event_type == event_types::STREAMING_RESPONSE_RECORDED)
        .expect("finalize event");
    assert_eq!(summary.payload["ingress_chunks"], cap as u64);
    assert_eq!(summary.payload["egress_chunks"], cap as u64);
    assert_eq!(summary.payload["truncated"], true);
}

#[tokio::test]
async fn oversized_request_body_is_rejected_with_413() {
    let upstream = mock_upstream_json(json!({"id": "r1", "choices": [], "model": "m"})).await;
    let extra = "server:\n  max_body_bytes: 256\n";
    let (address, _events) = serve_proxy(base_config(upstream, "NoOpPolicy", extra)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x".repeat(4096)}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn anthropic_validation_failure_returns_anthropic_error_body() {
    let upstream = mock_upstream_json(json!({"id": "r1", "choices": [], "model": "m"})).await;
    let (address, _events) = serve_proxy(base_config(upstream, "NoOpPolicy", "")).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}/v1/messages"))
        .json(&json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_missing", "content": "?"}
            ]}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}
