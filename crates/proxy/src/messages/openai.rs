//! Normalized (OpenAI-shaped) request, response, and streaming chunk types.
//!
//! These are the interchange types of the whole pipeline: ingress requests of
//! either dialect are converted into [`ChatRequest`], policies see
//! [`ChatChunk`]s, and client formatters convert back out. Optional fields
//! use `skip_serializing_if` throughout so a request that passes through an
//! inactive policy re-serializes without invented fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat completion request in the normalized dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier, forwarded verbatim to the backend.
    pub model: String,

    /// Ordered conversation messages. Ordering is preserved end to end.
    pub messages: Vec<ChatMessage>,

    /// Tool catalog offered to the model.
    ///
    /// Deduplicated by function name before the request leaves the proxy;
    /// one downstream provider rejects duplicate names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Tool choice directive, passed through structurally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences; a bare string or a list on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,

    /// Response format hint, passed through structurally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Opaque metadata bag for session and trace identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl ChatRequest {
    /// Whether the client asked for a streaming response.
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Session identifier from the metadata bag, when the client sent one.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get("session_id"))
            .and_then(Value::as_str)
    }

    /// Enforce normalized-dialect invariants that serde alone cannot:
    /// deduplicate the tool catalog by name, last occurrence winning.
    pub fn normalize(&mut self) {
        if let Some(tools) = &mut self.tools {
            dedup_tools(tools);
        }
    }
}

/// Deduplicate tools by function name. The catalog keeps first-appearance
/// order but the last definition of a repeated name wins.
fn dedup_tools(tools: &mut Vec<Tool>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<Tool> = Vec::with_capacity(tools.len());

    for tool in tools.drain(..) {
        match seen.get(&tool.function.name) {
            Some(&slot) => deduped[slot] = tool,
            None => {
                seen.insert(tool.function.name.clone(), deduped.len());
                deduped.push(tool);
            }
        }
    }

    *tools = deduped;
}

/// Stop sequences accept both OpenAI encodings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    /// A single stop string.
    Single(String),
    /// Multiple stop strings.
    Many(Vec<String>),
}

impl StopSequences {
    /// View as a list regardless of wire encoding.
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            Self::Single(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,

    /// String content or an ordered list of typed parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    /// Tool calls on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// On `tool` messages, the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A plain-text message with the given role.
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Message content flattened to a single string.
    pub fn content_text(&self) -> String {
        self.content.as_ref().map(MessageContent::flatten).unwrap_or_default()
    }
}

/// Message sender role.
///
/// The `developer` wire role is accepted as an alias and normalized to
/// `system` on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    #[serde(alias = "developer")]
    System,
    User,
    Assistant,
    Tool,
}

/// String content or ordered typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenate all text parts into one string.
    pub fn flatten(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.as_str(),
                })
                .collect(),
        }
    }
}

/// A typed content part. Only text parts cross this proxy today.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

fn function_type() -> String {
    "function".to_string()
}

/// Function specification inside a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the accepted arguments.
    #[serde(default)]
    pub parameters: Value,
}

/// A completed tool call on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionCall,
}

/// Function name plus JSON-string arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// A chat completion response in the normalized dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,

    pub model: String,

    pub choices: Vec<ChatChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Content of the first choice, flattened to text.
    pub fn primary_content(&self) -> String {
        self.choices
            .first()
            .map(|choice| choice.message.content_text())
            .unwrap_or_default()
    }

    /// Finish reason of the first choice.
    pub fn primary_finish_reason(&self) -> Option<&FinishReason> {
        self.choices.first().and_then(|choice| choice.finish_reason.as_ref())
    }
}

/// One response candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Forward compatibility for reasons this proxy does not know about.
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ToolCalls => write!(f, "tool_calls"),
            Self::ContentFilter => write!(f, "content_filter"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Token usage counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One streaming envelope.
///
/// All chunks of one response share an id; the core never reorders them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub choices: Vec<ChunkChoice>,

    /// Present only on usage-bearing chunks, typically the last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatChunk {
    /// Delta of the first choice.
    pub fn first_delta(&self) -> Option<&ChunkDelta> {
        self.choices.first().map(|choice| &choice.delta)
    }

    /// Finish reason of the first choice.
    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.choices.first().and_then(|choice| choice.finish_reason.as_ref())
    }

    /// Whether any choice carries a tool-call delta.
    pub fn has_tool_call_delta(&self) -> bool {
        self.choices
            .iter()
            .any(|choice| choice.delta.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()))
    }
}

/// Incremental update for one choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Partial message content inside one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Present in the first chunk only, announcing the role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,

    /// Text fragment to append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Thinking (reasoning) fragment, provider-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    /// Cryptographic signature for the preceding thinking block.
    /// May arrive after text has already begun.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Opaque redacted-thinking payload, delivered as one complete block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_thinking: Option<String>,

    /// Tool-call fragments addressed by index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Tool-call fragment addressed by index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

/// Function fragment of a tool-call delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A chunk carrying only a text fragment, with an optional finish reason.
pub fn build_text_chunk(
    id: impl Into<String>,
    model: impl Into<String>,
    text: impl Into<String>,
    finish_reason: Option<FinishReason>,
) -> ChatChunk {
    ChatChunk {
        id: id.into(),
        object: Some("chat.completion.chunk".to_string()),
        created: None,
        model: model.into(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                content: Some(text.into()),
                ..Default::default()
            },
            finish_reason,
        }],
        usage: None,
    }
}

/// A chunk carrying one complete tool call, as a policy releases after
/// buffering an entire block.
pub fn build_tool_call_chunk(
    id: impl Into<String>,
    model: impl Into<String>,
    index: usize,
    call_id: impl Into<String>,
    name: impl Into<String>,
    arguments: impl Into<String>,
) -> ChatChunk {
    ChatChunk {
        id: id.into(),
        object: Some("chat.completion.chunk".to_string()),
        created: None,
        model: model.into(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: Some(call_id.into()),
                    call_type: Some("function".to_string()),
                    function: Some(FunctionDelta {
                        name: Some(name.into()),
                        arguments: Some(arguments.into()),
                    }),
                }]),
                ..Default::default()
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

/// A chunk carrying only a finish reason, with optional usage.
pub fn build_finish_chunk(
    id: impl Into<String>,
    model: impl Into<String>,
    finish_reason: FinishReason,
    usage: Option<Usage>,
) -> ChatChunk {
    ChatChunk {
        id: id.into(),
        object: Some("chat.completion.chunk".to_string()),
        created: None,
        model: model.into(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some(finish_reason),
        }],
        usage,
    }
}
