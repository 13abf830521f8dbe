//! Anthropic-native backend, including the stream reader that turns
//! Anthropic SSE events back into normalized chunks.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use crate::convert::finish_reason_from_stop;
use crate::convert::to_anthropic::messages_request_from_chat;
use crate::error::{ProxyError, ProxyResult, map_backend_status};
use crate::messages::anthropic::{ContentBlock, ContentDelta, MessagesResponse, StreamEvent};
use crate::messages::openai::{
    ChatChoice, ChatChunk, ChatMessage, ChatRequest, ChatResponse, ChatRole, ChunkChoice, ChunkDelta, FunctionCall,
    FunctionDelta, MessageContent, ToolCall, ToolCallDelta, Usage,
};
use crate::streaming::ChunkStream;
use crate::upstream::{Backend, http_client};

const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl AnthropicBackend {
    pub fn new(config: &config::UpstreamConfig) -> ProxyResult<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_string()),
            api_key: config.api_key.clone(),
        })
    }

    async fn post_messages(&self, request: ChatRequest, stream: bool) -> ProxyResult<reqwest::Response> {
        let url = format!("{}/messages", self.base_url);

        let mut anthropic_request = messages_request_from_chat(request);
        anthropic_request.stream = Some(stream);

        let body = sonic_rs::to_vec(&anthropic_request).map_err(|error| {
            log::error!("failed to serialize Anthropic request: {error}");
            ProxyError::Internal(None)
        })?;

        let mut builder = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(api_key) = &self.api_key {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|error| ProxyError::Connection(format!("failed to send request to Anthropic: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Anthropic API error ({status}): {error_text}");
            return Err(map_backend_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn complete(&self, request: ChatRequest) -> ProxyResult<ChatResponse> {
        let response = self.post_messages(request, false).await?;

        let response_text = response.text().await.map_err(|error| {
            log::error!("failed to read Anthropic response body: {error}");
            ProxyError::Internal(None)
        })?;

        let messages_response: MessagesResponse = sonic_rs::from_str(&response_text).map_err(|error| {
            log::error!("failed to parse Anthropic messages response: {error}");
            ProxyError::Internal(None)
        })?;

        Ok(chat_response_from_messages(messages_response))
    }

    async fn stream(&self, request: ChatRequest) -> ProxyResult<ChunkStream> {
        let response = self.post_messages(request, true).await?;

        let event_stream = response.bytes_stream().eventsource();

        // unfold keeps the reader state across events; each upstream event
        // yields at most one normalized chunk.
        let chunk_stream = futures::stream::unfold(
            (Box::pin(event_stream), AnthropicStreamReader::new()),
            |(mut stream, mut reader)| async move {
                loop {
                    let event = stream.next().await?;

                    let Ok(event) = event else {
                        log::warn!("SSE parsing error in Anthropic stream");
                        continue;
                    };

                    let Ok(stream_event) = sonic_rs::from_str::<StreamEvent>(&event.data) else {
                        log::warn!("failed to parse Anthropic streaming event");
                        continue;
                    };

                    if let StreamEvent::Error { error } = &stream_event {
                        log::error!("Anthropic stream error event: {} - {}", error.error_type, error.message);
                    }

                    if let Some(chunk) = reader.process_event(stream_event) {
                        return Some((Ok(chunk), (stream, reader)));
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Convert a non-streaming Anthropic response to the normalized dialect.
fn chat_response_from_messages(response: MessagesResponse) -> ChatResponse {
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in response.content {
        match block {
            ContentBlock::Text { text } => content.push_str(&text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                tool_type: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult { .. } | ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
        }
    }

    ChatResponse {
        id: response.id,
        object: Some("chat.completion".to_string()),
        created: None,
        model: response.model,
        choices: vec![ChatChoice {
            index: Some(0),
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: if content.is_empty() {
                    None
                } else {
                    Some(MessageContent::Text(content))
                },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
            },
            finish_reason: response.stop_reason.as_ref().map(finish_reason_from_stop),
        }],
        usage: Some(Usage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        }),
    }
}

/// State machine converting Anthropic stream events to normalized chunks.
///
/// Tool-call deltas carry the same index the source block used, so the
/// downstream assembler keys its buffers identically to the upstream.
pub struct AnthropicStreamReader {
    message_id: String,
    model: String,
}

impl Default for AnthropicStreamReader {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicStreamReader {
    pub fn new() -> Self {
        Self {
            message_id: String::new(),
            model: String::new(),
        }
    }

    fn chunk_with_delta(&self, delta: ChunkDelta, finish: Option<crate::messages::openai::FinishReason>) -> ChatChunk {
        ChatChunk {
            id: self.message_id.clone(),
            object: Some("chat.completion.chunk".to_string()),
            created: None,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage: None,
        }
    }

    /// Process one upstream event, yielding a normalized chunk when the
    /// event carries content.
    pub fn process_event(&mut self, event: StreamEvent) -> Option<ChatChunk> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.message_id = message.id;
                self.model = message.model;

                Some(self.chunk_with_delta(
                    ChunkDelta {
                        role: Some(ChatRole::Assistant),
                        ..Default::default()
                    },
                    None,
                ))
            }

            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => Some(self.chunk_with_delta(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: index as usize,
                            id: Some(id),
                            call_type: Some("function".to_string()),
                            function: Some(FunctionDelta {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                )),
                ContentBlock::RedactedThinking { data } => Some(self.chunk_with_delta(
                    ChunkDelta {
                        redacted_thinking: Some(data),
                        ..Default::default()
                    },
                    None,
                )),
                _ => None,
            },

            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => Some(self.chunk_with_delta(
                    ChunkDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )),
                ContentDelta::InputJsonDelta { partial_json } => Some(self.chunk_with_delta(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: index as usize,
                            id: None,
                            call_type: None,
                            function: Some(FunctionDelta {
                                name: None,
                                arguments: Some(partial_json),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                )),
                ContentDelta::ThinkingDelta { thinking } => Some(self.chunk_with_delta(
                    ChunkDelta {
                        reasoning_content: Some(thinking),
                        ..Default::default()
                    },
                    None,
                )),
                ContentDelta::SignatureDelta { signature } => Some(self.chunk_with_delta(
                    ChunkDelta {
                        signature: Some(signature),
                        ..Default::default()
                    },
                    None,
                )),
            },

            StreamEvent::MessageDelta { delta, usage } => {
                let finish = delta
                    .stop_reason
                    .as_ref()
                    .map(finish_reason_from_stop)
                    .unwrap_or(crate::messages::openai::FinishReason::Stop);

                let mut chunk = self.chunk_with_delta(ChunkDelta::default(), Some(finish));
                chunk.usage = Some(Usage {
                    prompt_tokens: usage.input_tokens,
                    completion_tokens: usage.output_tokens,
                    total_tokens: usage.input_tokens + usage.output_tokens,
                });

                Some(chunk)
            }

            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::AnthropicStreamReader;
    use crate::messages::anthropic::StreamEvent;
    use crate::messages::openai::FinishReason;

    fn event(value: serde_json::Value) -> StreamEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn message_start_yields_role_chunk_with_metadata() {
        let mut reader = AnthropicStreamReader::new();

        let chunk = reader
            .process_event(event(json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1", "type": "message", "role": "assistant",
                    "content": [], "model": "claude-3-5-sonnet-20241022",
                    "stop_reason": null, "stop_sequence": null,
                    "usage": {"input_tokens": 10, "output_tokens": 0}
                }
            })))
            .unwrap();

        assert_eq!(chunk.id, "msg_1");
        assert_eq!(chunk.model, "claude-3-5-sonnet-20241022");
        assert!(chunk.first_delta().unwrap().role.is_some());
    }

    #[test]
    fn tool_use_block_events_carry_source_index() {
        let mut reader = AnthropicStreamReader::new();

        let start = reader
            .process_event(event(json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search"}
            })))
            .unwrap();

        let calls = start.first_delta().unwrap().tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 1);
        assert_eq!(calls[0].id.as_deref(), Some("toolu_1"));

        let delta = reader
            .process_event(event(json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}
            })))
            .unwrap();

        let calls = delta.first_delta().unwrap().tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 1);
        assert_eq!(
            calls[0].function.as_ref().unwrap().arguments.as_deref(),
            Some("{\"q\":")
        );
    }

    #[test]
    fn message_delta_maps_stop_reason_and_usage() {
        let mut reader = AnthropicStreamReader::new();

        let chunk = reader
            .process_event(event(json!({
                "type": "message_delta",
                "delta": {"stop_reason": "tool_use", "stop_sequence": null},
                "usage": {"input_tokens": 5, "output_tokens": 7}
            })))
            .unwrap();

        assert_eq!(chunk.finish_reason(), Some(&FinishReason::ToolCalls));
        assert_eq!(chunk.usage.unwrap().completion_tokens, 7);
    }

    #[test]
    fn lifecycle_only_events_yield_nothing() {
        let mut reader = AnthropicStreamReader::new();

        assert!(reader.process_event(event(json!({"type": "ping"}))).is_none());
        assert!(
            reader
                .process_event(event(json!({"type": "content_block_stop", "index": 0})))
                .is_none()
        );
        assert!(reader.process_event(event(json!({"type": "message_stop"}))).is_none());
    }

    #[test]
    fn thinking_events_become_reasoning_and_signature_deltas() {
        let mut reader = AnthropicStreamReader::new();

        let thinking = reader
            .process_event(event(json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "thinking_delta", "thinking": "hmm"}
            })))
            .unwrap();
        assert_eq!(thinking.first_delta().unwrap().reasoning_content.as_deref(), Some("hmm"));

        let signature = reader
            .process_event(event(json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "signature_delta", "signature": "sig"}
            })))
            .unwrap();
        assert_eq!(signature.first_delta().unwrap().signature.as_deref(), Some("sig"));
    }
}
