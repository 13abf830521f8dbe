//! Stream blocks: maximal runs of same-kind deltas within one response.

/// A maximal run of deltas of one kind.
///
/// At most one block is open per stream at a time; tool-call blocks are
/// additionally distinguished by index so interleaved parallel calls cannot
/// corrupt each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamBlock {
    Content(ContentStreamBlock),
    ToolCall(ToolCallStreamBlock),
    Thinking(ThinkingStreamBlock),
}

impl StreamBlock {
    /// The accumulated tool call, when this is a tool-call block.
    pub fn as_tool_call(&self) -> Option<&ToolCallStreamBlock> {
        match self {
            Self::ToolCall(block) => Some(block),
            _ => None,
        }
    }

    /// The accumulated text, when this is a content block.
    pub fn as_content(&self) -> Option<&ContentStreamBlock> {
        match self {
            Self::Content(block) => Some(block),
            _ => None,
        }
    }
}

/// Accumulated text of one content block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentStreamBlock {
    pub text: String,
}

/// Accumulated state of one tool call, keyed by delta index.
///
/// Fragments concatenate: the id and name usually arrive whole in the first
/// delta while arguments build up across many.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallStreamBlock {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Accumulated reasoning text, with the signature that may trail it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinkingStreamBlock {
    pub text: String,
    pub signature: Option<String>,
}
