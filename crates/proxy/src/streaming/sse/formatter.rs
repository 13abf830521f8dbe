//! Per-dialect wire formatters: normalized chunks → SSE frames.

use axum::response::sse::Event;

use crate::error::ProxyError;
use crate::messages::anthropic::{AnthropicErrorBody, MessageStartPayload, StreamEvent};
use crate::messages::openai::ChatChunk;
use crate::streaming::sse::assembler::{AnthropicSseAssembler, ProtocolWarning};

/// One SSE frame headed for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// SSE `event:` field; absent for the normalized dialect.
    pub event: Option<&'static str>,
    /// SSE `data:` payload.
    pub data: String,
}

impl WireFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn event(event: &'static str, data: impl Into<String>) -> Self {
        Self {
            event: Some(event),
            data: data.into(),
        }
    }

    /// Render as an axum SSE event.
    pub fn into_sse_event(self) -> Event {
        let event = Event::default().data(self.data);
        match self.event {
            Some(name) => event.event(name),
            None => event,
        }
    }
}

/// Formats one streaming response for a client dialect.
pub trait ClientFormatter: Send {
    /// Frames for one policy-released chunk.
    fn on_chunk(&mut self, chunk: ChatChunk) -> Vec<WireFrame>;

    /// Frames terminating a successful stream.
    fn finish(&mut self) -> Vec<WireFrame>;

    /// Frames for a mid-stream failure. The stream ends after these.
    fn on_error(&mut self, error: &ProxyError) -> Vec<WireFrame>;

    /// Protocol anomalies observed since the last call, for event recording.
    fn take_warnings(&mut self) -> Vec<ProtocolWarning> {
        Vec::new()
    }
}

/// Normalized dialect: one `data: {json}` frame per chunk, closed by
/// `data: [DONE]`.
pub struct OpenAiFormatter;

impl ClientFormatter for OpenAiFormatter {
    fn on_chunk(&mut self, chunk: ChatChunk) -> Vec<WireFrame> {
        match sonic_rs::to_string(&chunk) {
            Ok(json) => vec![WireFrame::data(json)],
            Err(error) => {
                log::error!("failed to serialize chunk: {error}");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<WireFrame> {
        vec![WireFrame::data("[DONE]")]
    }

    fn on_error(&mut self, error: &ProxyError) -> Vec<WireFrame> {
        let body = serde_json::json!({
            "error": {
                "message": error.client_message(),
                "type": error.error_type(),
                "code": error.status_code().as_u16(),
            }
        });

        vec![WireFrame::data(body.to_string())]
    }
}

/// Anthropic dialect: `message_start`, reassembled block lifecycle events,
/// `message_stop`.
pub struct AnthropicFormatter {
    assembler: AnthropicSseAssembler,
    fallback_model: String,
    message_started: bool,
}

impl AnthropicFormatter {
    pub fn new(fallback_model: impl Into<String>) -> Self {
        Self {
            assembler: AnthropicSseAssembler::new(),
            fallback_model: fallback_model.into(),
            message_started: false,
        }
    }

    fn frame(event: &StreamEvent) -> Option<WireFrame> {
        match sonic_rs::to_string(event) {
            Ok(json) => Some(WireFrame::event(event.name(), json)),
            Err(error) => {
                log::error!("failed to serialize Anthropic stream event: {error}");
                None
            }
        }
    }

    fn ensure_message_start(&mut self, chunk: &ChatChunk, frames: &mut Vec<WireFrame>) {
        if self.message_started {
            return;
        }
        self.message_started = true;

        let model = if chunk.model.is_empty() {
            self.fallback_model.clone()
        } else {
            chunk.model.clone()
        };

        let start = StreamEvent::MessageStart {
            message: MessageStartPayload::new(chunk.id.clone(), model),
        };
        frames.extend(Self::frame(&start));
    }
}

impl ClientFormatter for AnthropicFormatter {
    fn on_chunk(&mut self, chunk: ChatChunk) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        self.ensure_message_start(&chunk, &mut frames);

        for event in self.assembler.process_chunk(&chunk) {
            frames.extend(Self::frame(&event));
        }

        frames
    }

    fn finish(&mut self) -> Vec<WireFrame> {
        let mut frames = Vec::new();

        if !self.message_started {
            // Zero-chunk stream; announce an empty message so the terminal
            // event sequence stays structurally valid.
            self.message_started = true;
            let start = StreamEvent::MessageStart {
                message: MessageStartPayload::new(String::new(), self.fallback_model.clone()),
            };
            frames.extend(Self::frame(&start));
        }

        for event in self.assembler.finish() {
            frames.extend(Self::frame(&event));
        }

        frames.extend(Self::frame(&StreamEvent::MessageStop));
        frames
    }

    fn on_error(&mut self, error: &ProxyError) -> Vec<WireFrame> {
        let event = StreamEvent::Error {
            error: AnthropicErrorBody {
                error_type: error.error_type().to_string(),
                message: error.client_message(),
            },
        };

        Self::frame(&event).into_iter().collect()
    }

    fn take_warnings(&mut self) -> Vec<ProtocolWarning> {
        self.assembler.take_warnings()
    }
}
