//! The transaction recorder: bounded chunk capture and end-of-stream
//! response reconstruction.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use storage::event_types;

use crate::messages::openai::{ChatChoice, ChatChunk, ChatMessage, ChatResponse, ChatRole, FinishReason, MessageContent};
use crate::observability::context::ObservabilityContext;

/// Reason string on truncation events, asserted on by integrations.
const TRUNCATION_REASON: &str = "max_chunks_queued_exceeded";

#[derive(Default)]
struct Side {
    chunks: Vec<ChatChunk>,
    truncated: bool,
}

struct RecorderState {
    ingress: Side,
    egress: Side,
}

/// Captures ingress and egress chunks for one transaction, each side bounded
/// by the configured cap. On overflow a single truncation event is emitted
/// and further chunks on that side are discarded; the transaction itself is
/// never failed. At stream end the recorder reconstructs synthetic
/// non-streaming responses from both sides and emits one summary event.
pub struct TransactionRecorder {
    obs: Arc<ObservabilityContext>,
    cap: usize,
    state: Mutex<RecorderState>,
}

impl TransactionRecorder {
    pub fn new(obs: Arc<ObservabilityContext>, cap: usize) -> Self {
        Self {
            obs,
            cap,
            state: Mutex::new(RecorderState {
                ingress: Side::default(),
                egress: Side::default(),
            }),
        }
    }

    /// Capture a chunk arriving from the backend, before the policy saw it.
    pub fn add_ingress_chunk(&self, chunk: &ChatChunk) {
        self.add(chunk, "ingress");
    }

    /// Capture a chunk released by the policy toward the client.
    pub fn add_egress_chunk(&self, chunk: &ChatChunk) {
        self.add(chunk, "egress");
    }

    fn add(&self, chunk: &ChatChunk, direction: &'static str) {
        let overflowed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let side = match direction {
                "ingress" => &mut state.ingress,
                _ => &mut state.egress,
            };

            if side.chunks.len() < self.cap {
                side.chunks.push(chunk.clone());
                false
            } else if side.truncated {
                false
            } else {
                side.truncated = true;
                true
            }
        };

        if overflowed {
            self.obs.record_event(
                event_types::CHUNKS_TRUNCATED,
                json!({
                    "direction": direction,
                    "reason": TRUNCATION_REASON,
                    "cap": self.cap,
                }),
            );
        }
    }

    /// Reconstruct both synthetic responses and emit the stream summary.
    pub fn finalize_streaming(&self) {
        let (original, final_, counts) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (
                reconstruct_response(&state.ingress.chunks),
                reconstruct_response(&state.egress.chunks),
                json!({
                    "ingress_chunks": state.ingress.chunks.len(),
                    "egress_chunks": state.egress.chunks.len(),
                    "truncated": state.ingress.truncated || state.egress.truncated,
                }),
            )
        };

        let mut payload = json!({
            "original": original,
            "final": final_,
        });
        if let (Some(object), Some(extra)) = (payload.as_object_mut(), counts.as_object()) {
            object.extend(extra.clone());
        }

        self.obs
            .record_event(event_types::STREAMING_RESPONSE_RECORDED, payload);
    }

    /// Emit the summary for a non-streaming transaction.
    pub fn record_non_streaming(&self, original: &ChatResponse, final_: &ChatResponse) {
        self.obs.record_event(
            event_types::NON_STREAMING_RESPONSE_RECORDED,
            json!({
                "original": original,
                "final": final_,
                "original_finish_reason": original.primary_finish_reason(),
                "final_finish_reason": final_.primary_finish_reason(),
            }),
        );
    }
}

/// Build a synthetic non-streaming response from captured chunks:
/// concatenated content, id/model from the first chunk carrying them, and
/// the finish reason from the last chunk that had one.
pub fn reconstruct_response(chunks: &[ChatChunk]) -> ChatResponse {
    let mut id = String::new();
    let mut model = String::new();
    let mut content = String::new();
    let mut finish_reason: Option<FinishReason> = None;
    let mut usage = None;

    for chunk in chunks {
        if id.is_empty() && !chunk.id.is_empty() {
            id = chunk.id.clone();
        }
        if model.is_empty() && !chunk.model.is_empty() {
            model = chunk.model.clone();
        }
        if let Some(delta) = chunk.first_delta()
            && let Some(text) = &delta.content
        {
            content.push_str(text);
        }
        if let Some(reason) = chunk.finish_reason() {
            finish_reason = Some(reason.clone());
        }
        if let Some(chunk_usage) = chunk.usage {
            usage = Some(chunk_usage);
        }
    }

    ChatResponse {
        id,
        object: None,
        created: None,
        model,
        choices: vec![ChatChoice {
            index: Some(0),
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: Some(MessageContent::Text(content)),
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: finish_reason.or(Some(FinishReason::Stop)),
        }],
        usage,
    }
}
