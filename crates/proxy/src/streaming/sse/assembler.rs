//! Reconstructs Anthropic SSE event sequences from normalized chunks.
//!
//! Policies work on normalized chunks, which lose Anthropic block indices
//! and lifecycle events. Anthropic clients require sequential indices
//! (0, 1, 2, ...) and strict `content_block_start` → `content_block_delta` →
//! `content_block_stop` ordering, so this assembler tracks block state per
//! response and re-derives both.

use crate::convert::stop_reason_from_finish;
use crate::messages::anthropic::{
    AnthropicUsage, ContentBlock, ContentDelta, MessageDeltaPayload, StreamEvent,
};
use crate::messages::openai::{ChatChunk, FinishReason, Usage};

/// What one normalized chunk means in Anthropic terms, before indices and
/// lifecycle are applied. Stateless classification.
#[derive(Debug)]
enum ChunkEvent {
    /// A whole tool call in one chunk: a policy buffered and released it.
    CompleteToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Progressive tool-call start carrying id and name.
    ToolCallStart { id: String, name: String },
    /// Progressive argument fragment.
    ToolCallDelta { partial_json: String },
    /// Thinking text fragment.
    Thinking { text: String },
    /// Signature for the last thinking block.
    Signature { signature: String },
    /// A complete redacted-thinking block.
    RedactedThinking { data: String },
    /// Plain text fragment.
    Text { text: String },
    /// Finish reason only.
    Finish { finish: FinishReason, usage: Option<Usage> },
    /// Nothing to emit (role announcements, empty deltas, usage-only).
    Empty,
}

fn classify(chunk: &ChatChunk) -> ChunkEvent {
    let Some(choice) = chunk.choices.first() else {
        return ChunkEvent::Empty;
    };

    let delta = &choice.delta;

    if let Some(calls) = delta.tool_calls.as_deref()
        && let Some(call) = calls.first()
    {
        let id = call.id.clone().filter(|id| !id.is_empty());
        let name = call
            .function
            .as_ref()
            .and_then(|function| function.name.clone())
            .unwrap_or_default();
        let arguments = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.clone())
            .filter(|arguments| !arguments.is_empty());

        return match (id, arguments) {
            (Some(id), Some(arguments)) => ChunkEvent::CompleteToolCall { id, name, arguments },
            (Some(id), None) => ChunkEvent::ToolCallStart { id, name },
            (None, Some(arguments)) => ChunkEvent::ToolCallDelta { partial_json: arguments },
            (None, None) => ChunkEvent::ToolCallDelta {
                partial_json: String::new(),
            },
        };
    }

    if let Some(text) = delta.reasoning_content.clone().filter(|text| !text.is_empty()) {
        return ChunkEvent::Thinking { text };
    }

    if let Some(signature) = delta.signature.clone() {
        return ChunkEvent::Signature { signature };
    }

    if let Some(data) = delta.redacted_thinking.clone() {
        return ChunkEvent::RedactedThinking { data };
    }

    if let Some(text) = delta.content.clone().filter(|text| !text.is_empty()) {
        return ChunkEvent::Text { text };
    }

    if let Some(finish) = &choice.finish_reason {
        return ChunkEvent::Finish {
            finish: finish.clone(),
            usage: chunk.usage,
        };
    }

    ChunkEvent::Empty
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
    ToolUse,
}

/// A protocol anomaly the caller should record as a warning event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolWarning(pub String);

/// Stateful assembler; one instance per streaming response.
///
/// Indices are assigned in the order blocks open and never reused. A
/// signature may arrive after text has begun, so a thinking block's stop is
/// deferred (`thinking_needs_close`) until its signature lands or the
/// message ends.
pub struct AnthropicSseAssembler {
    block_started: bool,
    block_index: u32,
    current_block_type: Option<BlockKind>,
    last_thinking_block_index: Option<u32>,
    thinking_needs_close: bool,
    message_delta_sent: bool,
    warnings: Vec<ProtocolWarning>,
}

impl AnthropicSseAssembler {
    pub fn new() -> Self {
        Self {
            block_started: false,
            block_index: 0,
            current_block_type: None,
            last_thinking_block_index: None,
            thinking_needs_close: false,
            message_delta_sent: false,
            warnings: Vec::new(),
        }
    }

    /// Warnings accumulated so far; drained by the caller.
    pub fn take_warnings(&mut self) -> Vec<ProtocolWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Process one normalized chunk into zero or more Anthropic events.
    pub fn process_chunk(&mut self, chunk: &ChatChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        match classify(chunk) {
            ChunkEvent::CompleteToolCall { id, name, arguments } => {
                self.close_open_block(&mut events);

                events.push(StreamEvent::ContentBlockStart {
                    index: self.block_index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: ContentDelta::InputJsonDelta { partial_json: arguments },
                });
                events.push(StreamEvent::ContentBlockStop { index: self.block_index });
                self.block_index += 1;

                // The releasing policy may fold the finish into this chunk.
                if let Some(finish) = chunk.finish_reason() {
                    self.push_message_delta(&mut events, finish, chunk.usage);
                }
            }

            ChunkEvent::RedactedThinking { data } => {
                self.flush_pending_thinking_stop(&mut events);
                self.close_open_block(&mut events);

                events.push(StreamEvent::ContentBlockStart {
                    index: self.block_index,
                    content_block: ContentBlock::RedactedThinking { data },
                });
                events.push(StreamEvent::ContentBlockStop { index: self.block_index });
                self.block_index += 1;
            }

            ChunkEvent::ToolCallStart { id, name } => {
                self.close_open_block(&mut events);

                self.block_started = true;
                self.current_block_type = Some(BlockKind::ToolUse);
                events.push(StreamEvent::ContentBlockStart {
                    index: self.block_index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });
            }

            ChunkEvent::Signature { signature } => {
                let Some(thinking_index) = self.last_thinking_block_index else {
                    self.warnings.push(ProtocolWarning(
                        "signature delta arrived before any thinking block; dropped".to_string(),
                    ));
                    return events;
                };

                events.push(StreamEvent::ContentBlockDelta {
                    index: thinking_index,
                    delta: ContentDelta::SignatureDelta { signature },
                });

                if self.thinking_needs_close {
                    events.push(StreamEvent::ContentBlockStop { index: thinking_index });
                    self.thinking_needs_close = false;
                }
            }

            ChunkEvent::Thinking { text } => {
                self.delta_into_block(&mut events, BlockKind::Thinking, ContentDelta::ThinkingDelta { thinking: text });
            }

            ChunkEvent::Text { text } => {
                self.delta_into_block(&mut events, BlockKind::Text, ContentDelta::TextDelta { text });
            }

            ChunkEvent::ToolCallDelta { partial_json } => {
                self.delta_into_block(
                    &mut events,
                    BlockKind::ToolUse,
                    ContentDelta::InputJsonDelta { partial_json },
                );
            }

            ChunkEvent::Finish { finish, usage } => {
                self.push_message_delta(&mut events, &finish, usage);
            }

            ChunkEvent::Empty => {}
        }

        events
    }

    /// Close anything still open when the stream ends without a finish.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.flush_pending_thinking_stop(&mut events);
        self.close_open_block(&mut events);
        events
    }

    fn delta_into_block(&mut self, events: &mut Vec<StreamEvent>, target: BlockKind, delta: ContentDelta) {
        // A kind change closes the previous block, except that leaving a
        // thinking block defers its stop until the signature lands.
        if self.block_started && self.current_block_type != Some(target) {
            if self.current_block_type == Some(BlockKind::Thinking) {
                self.thinking_needs_close = true;
            } else {
                events.push(StreamEvent::ContentBlockStop { index: self.block_index });
            }
            self.block_started = false;
            self.block_index += 1;
        }

        if !self.block_started {
            self.block_started = true;
            self.current_block_type = Some(target);

            let content_block = match target {
                BlockKind::Thinking => {
                    self.last_thinking_block_index = Some(self.block_index);
                    ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    }
                }
                // Tool-use deltas with no preceding start have no id to
                // announce; degrade to a text block like the converter they
                // came from would have.
                BlockKind::Text | BlockKind::ToolUse => ContentBlock::Text { text: String::new() },
            };

            events.push(StreamEvent::ContentBlockStart {
                index: self.block_index,
                content_block,
            });
        }

        events.push(StreamEvent::ContentBlockDelta {
            index: self.block_index,
            delta,
        });
    }

    fn push_message_delta(&mut self, events: &mut Vec<StreamEvent>, finish: &FinishReason, usage: Option<Usage>) {
        self.flush_pending_thinking_stop(events);

        if self.block_started {
            events.push(StreamEvent::ContentBlockStop { index: self.block_index });
            self.block_started = false;
            self.current_block_type = None;
        }

        if self.message_delta_sent {
            return;
        }
        self.message_delta_sent = true;

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaPayload {
                stop_reason: Some(stop_reason_from_finish(finish)),
                stop_sequence: None,
            },
            usage: usage
                .map(|usage| AnthropicUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                })
                .unwrap_or_default(),
        });
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.block_started {
            events.push(StreamEvent::ContentBlockStop { index: self.block_index });
            self.block_started = false;
            self.block_index += 1;
        }
    }

    fn flush_pending_thinking_stop(&mut self, events: &mut Vec<StreamEvent>) {
        if self.thinking_needs_close
            && let Some(index) = self.last_thinking_block_index
        {
            events.push(StreamEvent::ContentBlockStop { index });
            self.thinking_needs_close = false;
        }
    }
}

impl Default for AnthropicSseAssembler {
    fn default() -> Self {
        Self::new()
    }
}
