//! Normalized → Anthropic conversion: requests for Anthropic-native
//! backends, responses for Anthropic-dialect clients.

use serde_json::Value;

use crate::convert::stop_reason_from_finish;
use crate::messages::anthropic::{
    AnthropicContent, AnthropicMessage, AnthropicRole, AnthropicTool, AnthropicToolChoice, AnthropicUsage,
    ContentBlock, MessagesRequest, MessagesResponse, SystemPrompt, ToolResultContent,
};
use crate::messages::openai::{ChatRequest, ChatResponse, ChatRole};

/// A recoverable anomaly observed during conversion, recorded as a warning
/// event by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionWarning(pub String);

/// Convert a normalized request into the Anthropic dialect for an
/// Anthropic-native backend.
pub fn messages_request_from_chat(request: ChatRequest) -> MessagesRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    for message in request.messages {
        match message.role {
            ChatRole::System => system_parts.push(message.content_text()),
            ChatRole::User => messages.push(AnthropicMessage {
                role: AnthropicRole::User,
                content: AnthropicContent::Text(message.content_text()),
            }),
            ChatRole::Assistant => {
                let mut blocks: Vec<ContentBlock> = Vec::new();

                let text = message.content_text();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }

                for call in message.tool_calls.unwrap_or_default() {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input: parse_arguments(&call.function.arguments),
                    });
                }

                messages.push(AnthropicMessage {
                    role: AnthropicRole::Assistant,
                    content: AnthropicContent::Blocks(blocks),
                });
            }
            // Tool results travel as tool_result blocks on user messages.
            ChatRole::Tool => messages.push(AnthropicMessage {
                role: AnthropicRole::User,
                content: AnthropicContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: Some(ToolResultContent::Text(message.content_text())),
                    is_error: None,
                }]),
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(SystemPrompt::Text(system_parts.join("\n")))
    };

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| AnthropicTool {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: tool.function.parameters,
            })
            .collect()
    });

    let tool_choice = request.tool_choice.as_ref().and_then(tool_choice_from_value);

    MessagesRequest {
        model: request.model,
        messages,
        system,
        max_tokens: request.max_tokens.unwrap_or(4096),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop.map(|stop| stop.as_vec()),
        stream: request.stream,
        tools,
        tool_choice,
        metadata: None,
    }
}

fn tool_choice_from_value(value: &Value) -> Option<AnthropicToolChoice> {
    if let Some(mode) = value.as_str() {
        return match mode {
            "auto" | "none" => Some(AnthropicToolChoice::Auto),
            "required" | "any" => Some(AnthropicToolChoice::Any),
            _ => None,
        };
    }

    let name = value.get("function")?.get("name")?.as_str()?;
    Some(AnthropicToolChoice::Tool { name: name.to_string() })
}

/// Convert a normalized non-streaming response into the Anthropic dialect.
///
/// Derives one content block list from the single choice: text first, then a
/// tool-use block per tool call. Unparseable tool-call arguments fall back to
/// an empty object and surface as a warning for the caller to record.
pub fn messages_response_from_chat(response: ChatResponse) -> (MessagesResponse, Vec<ConversionWarning>) {
    let mut warnings = Vec::new();
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut stop_reason = None;

    if let Some(choice) = response.choices.into_iter().next() {
        let text = choice.message.content_text();
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }

        for call in choice.message.tool_calls.unwrap_or_default() {
            let input = match serde_json::from_str(&call.function.arguments) {
                Ok(value) => value,
                Err(error) => {
                    warnings.push(ConversionWarning(format!(
                        "tool call '{}' carried unparseable arguments: {error}",
                        call.function.name
                    )));
                    Value::Object(serde_json::Map::new())
                }
            };

            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        stop_reason = choice.finish_reason.as_ref().map(stop_reason_from_finish);
    }

    let usage = response
        .usage
        .map(|usage| AnthropicUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
        .unwrap_or_default();

    let converted = MessagesResponse {
        id: response.id,
        response_type: "message".to_string(),
        role: AnthropicRole::Assistant,
        content,
        model: response.model,
        stop_reason,
        stop_sequence: None,
        usage,
    };

    (converted, warnings)
}

/// Arguments are a JSON string on the OpenAI side; empty or invalid JSON
/// degrades to an empty object the way Anthropic expects.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}
