//! The stream-state machine: parses each chunk into deltas belonging to
//! exactly one block, aggregates them, and detects block completion.

use crate::messages::openai::{ChatChunk, FinishReason};
use crate::streaming::blocks::{ContentStreamBlock, StreamBlock, ThinkingStreamBlock, ToolCallStreamBlock};

/// Live view of one streaming response, exposed to policies.
#[derive(Debug, Default)]
pub struct StreamState {
    /// Every chunk received so far, in order, for replay and aggregation.
    pub chunks: Vec<ChatChunk>,
    /// The currently open block, if any.
    pub current_block: Option<StreamBlock>,
    /// The block that completed while absorbing the most recent chunk.
    /// Cleared before each chunk is processed.
    pub just_completed: Option<StreamBlock>,
    /// Aggregated finish reason, once one arrived.
    pub finish_reason: Option<FinishReason>,
    /// All completed blocks, in completion order.
    pub blocks: Vec<StreamBlock>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chunk most recently absorbed.
    pub fn last_chunk(&self) -> Option<&ChatChunk> {
        self.chunks.last()
    }

    /// Response id observed on the stream, empty until the first chunk
    /// carrying one.
    pub fn response_id(&self) -> &str {
        self.chunks
            .iter()
            .map(|chunk| chunk.id.as_str())
            .find(|id| !id.is_empty())
            .unwrap_or("")
    }

    /// Model observed on the stream.
    pub fn model(&self) -> &str {
        self.chunks
            .iter()
            .map(|chunk| chunk.model.as_str())
            .find(|model| !model.is_empty())
            .unwrap_or("")
    }

    fn close_current(&mut self) {
        if let Some(block) = self.current_block.take() {
            self.blocks.push(block.clone());
            self.just_completed = Some(block);
        }
    }
}

/// Absorb one chunk into the state.
///
/// Invariants maintained: at most one open block per stream; a tool-call
/// block is keyed by its delta index; a block completes exactly when the
/// stream transitions to a different block kind or index, or when a finish
/// reason arrives.
pub fn absorb(state: &mut StreamState, chunk: ChatChunk) {
    state.just_completed = None;

    if let Some(choice) = chunk.choices.first() {
        let delta = &choice.delta;

        if let Some(reasoning) = delta.reasoning_content.as_deref()
            && !reasoning.is_empty()
        {
            match &mut state.current_block {
                Some(StreamBlock::Thinking(block)) => block.text.push_str(reasoning),
                _ => {
                    state.close_current();
                    state.current_block = Some(StreamBlock::Thinking(ThinkingStreamBlock {
                        text: reasoning.to_string(),
                        signature: None,
                    }));
                }
            }
        }

        if let Some(signature) = delta.signature.as_deref() {
            attach_signature(state, signature);
        }

        if let Some(content) = delta.content.as_deref()
            && !content.is_empty()
        {
            match &mut state.current_block {
                Some(StreamBlock::Content(block)) => block.text.push_str(content),
                _ => {
                    state.close_current();
                    state.current_block = Some(StreamBlock::Content(ContentStreamBlock {
                        text: content.to_string(),
                    }));
                }
            }
        }

        for tool_delta in delta.tool_calls.as_deref().unwrap_or_default() {
            let open_index = state
                .current_block
                .as_ref()
                .and_then(StreamBlock::as_tool_call)
                .map(|block| block.index);

            if open_index != Some(tool_delta.index) {
                state.close_current();
                state.current_block = Some(StreamBlock::ToolCall(ToolCallStreamBlock {
                    index: tool_delta.index,
                    ..Default::default()
                }));
            }

            if let Some(StreamBlock::ToolCall(block)) = &mut state.current_block {
                if let Some(id) = &tool_delta.id {
                    block.id.push_str(id);
                }
                if let Some(function) = &tool_delta.function {
                    if let Some(name) = &function.name {
                        block.name.push_str(name);
                    }
                    if let Some(arguments) = &function.arguments {
                        block.arguments.push_str(arguments);
                    }
                }
            }
        }

        if let Some(finish) = &choice.finish_reason {
            state.close_current();
            state.finish_reason = Some(finish.clone());
        }
    }

    state.chunks.push(chunk);
}

/// A signature attaches to the most recent thinking block, even if another
/// block has opened since.
fn attach_signature(state: &mut StreamState, signature: &str) {
    if let Some(StreamBlock::Thinking(block)) = &mut state.current_block {
        block.signature = Some(signature.to_string());
        return;
    }

    if let Some(StreamBlock::Thinking(block)) = state
        .blocks
        .iter_mut()
        .rev()
        .find(|block| matches!(block, StreamBlock::Thinking(_)))
    {
        block.signature = Some(signature.to_string());
    } else {
        log::warn!("signature delta arrived with no preceding thinking block");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::messages::openai::ChatChunk;

    fn content_chunk(text: &str) -> ChatChunk {
        serde_json::from_value(json!({
            "id": "c1", "model": "m",
            "choices": [{"index": 0, "delta": {"content": text}}]
        }))
        .unwrap()
    }

    fn tool_chunk(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ChatChunk {
        let mut function = serde_json::Map::new();
        if let Some(name) = name {
            function.insert("name".into(), json!(name));
        }
        if let Some(args) = args {
            function.insert("arguments".into(), json!(args));
        }

        let mut call = serde_json::Map::new();
        call.insert("index".into(), json!(index));
        if let Some(id) = id {
            call.insert("id".into(), json!(id));
        }
        call.insert("function".into(), json!(function));

        serde_json::from_value(json!({
            "id": "c1", "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [call]}}]
        }))
        .unwrap()
    }

    fn finish_chunk(reason: &str) -> ChatChunk {
        serde_json::from_value(json!({
            "id": "c1", "model": "m",
            "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
        }))
        .unwrap()
    }

    #[test]
    fn content_deltas_accumulate_into_one_block() {
        let mut state = StreamState::new();

        absorb(&mut state, content_chunk("he"));
        absorb(&mut state, content_chunk("llo"));

        let Some(StreamBlock::Content(block)) = &state.current_block else {
            unreachable!("expected open content block");
        };
        assert_eq!(block.text, "hello");
        assert!(state.just_completed.is_none());
    }

    #[test]
    fn finish_reason_closes_the_open_block() {
        let mut state = StreamState::new();

        absorb(&mut state, content_chunk("hello"));
        absorb(&mut state, finish_chunk("stop"));

        assert!(state.current_block.is_none());
        assert_eq!(state.finish_reason, Some(FinishReason::Stop));

        let Some(StreamBlock::Content(block)) = &state.just_completed else {
            unreachable!("expected completed content block");
        };
        assert_eq!(block.text, "hello");
        assert_eq!(state.blocks.len(), 1);
    }

    #[test]
    fn tool_call_fragments_concatenate_by_index() {
        let mut state = StreamState::new();

        absorb(&mut state, tool_chunk(0, Some("call_1"), Some("search"), Some("")));
        absorb(&mut state, tool_chunk(0, None, None, Some("{\"q\":")));
        absorb(&mut state, tool_chunk(0, None, None, Some("\"t\"}")));
        absorb(&mut state, finish_chunk("tool_calls"));

        let Some(StreamBlock::ToolCall(block)) = &state.just_completed else {
            unreachable!("expected completed tool-call block");
        };
        assert_eq!(block.id, "call_1");
        assert_eq!(block.name, "search");
        assert_eq!(block.arguments, "{\"q\":\"t\"}");
    }

    #[test]
    fn switching_tool_index_completes_previous_block() {
        let mut state = StreamState::new();

        absorb(&mut state, tool_chunk(0, Some("call_1"), Some("a"), Some("{}")));
        absorb(&mut state, tool_chunk(1, Some("call_2"), Some("b"), Some("{}")));

        let Some(StreamBlock::ToolCall(done)) = &state.just_completed else {
            unreachable!("expected completed tool-call block");
        };
        assert_eq!(done.id, "call_1");

        let Some(StreamBlock::ToolCall(open)) = &state.current_block else {
            unreachable!("expected open tool-call block");
        };
        assert_eq!(open.index, 1);
    }

    #[test]
    fn content_after_tool_call_completes_the_tool_block() {
        let mut state = StreamState::new();

        absorb(&mut state, tool_chunk(0, Some("call_1"), Some("a"), Some("{}")));
        absorb(&mut state, content_chunk("done"));

        assert!(matches!(state.just_completed, Some(StreamBlock::ToolCall(_))));
        assert!(matches!(state.current_block, Some(StreamBlock::Content(_))));
    }

    #[test]
    fn signature_attaches_to_thinking_block_after_text_started() {
        let mut state = StreamState::new();

        let thinking: ChatChunk = serde_json::from_value(json!({
            "id": "c1", "model": "m",
            "choices": [{"index": 0, "delta": {"reasoning_content": "pondering"}}]
        }))
        .unwrap();
        absorb(&mut state, thinking);

        absorb(&mut state, content_chunk("answer"));

        let signature: ChatChunk = serde_json::from_value(json!({
            "id": "c1", "model": "m",
            "choices": [{"index": 0, "delta": {"signature": "sig123"}}]
        }))
        .unwrap();
        absorb(&mut state, signature);

        let Some(StreamBlock::Thinking(block)) = state
            .blocks
            .iter()
            .find(|block| matches!(block, StreamBlock::Thinking(_)))
        else {
            unreachable!("expected a completed thinking block");
        };
        assert_eq!(block.signature.as_deref(), Some("sig123"));
    }

    #[test]
    fn just_completed_clears_on_next_chunk() {
        let mut state = StreamState::new();

        absorb(&mut state, tool_chunk(0, Some("call_1"), Some("a"), Some("{}")));
        absorb(&mut state, content_chunk("x"));
        assert!(state.just_completed.is_some());

        absorb(&mut state, content_chunk("y"));
        assert!(state.just_completed.is_none());
    }
}
