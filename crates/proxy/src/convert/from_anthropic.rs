//! Anthropic → normalized request conversion.

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};

use crate::error::{ProxyError, ProxyResult};
use crate::messages::anthropic::{
    AnthropicContent, AnthropicMessage, AnthropicRole, AnthropicToolChoice, ContentBlock, MessagesRequest,
};
use crate::messages::openai::{
    ChatMessage, ChatRequest, ChatRole, FunctionCall, FunctionDef, MessageContent, StopSequences, Tool, ToolCall,
};

/// Convert an Anthropic messages request into the normalized dialect.
///
/// The system field becomes a leading system message, tool-use blocks become
/// assistant tool calls, tool-result blocks become `tool` messages keyed by
/// the call id, and consecutive text blocks concatenate. A tool result
/// referencing an id no earlier tool-use block produced is an
/// [`ProxyError::InvalidRequest`].
pub fn chat_request_from_messages(request: MessagesRequest) -> ProxyResult<ChatRequest> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(ChatMessage::text(ChatRole::System, system.flatten()));
    }

    let mut known_tool_use_ids: HashSet<String> = HashSet::new();

    for message in request.messages {
        convert_message(message, &mut messages, &mut known_tool_use_ids)?;
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| Tool {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                },
            })
            .collect()
    });

    let tool_choice = request.tool_choice.map(|choice| match choice {
        AnthropicToolChoice::Auto => Value::String("auto".to_string()),
        AnthropicToolChoice::Any => Value::String("required".to_string()),
        AnthropicToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    });

    let metadata = request.metadata.and_then(|metadata| {
        metadata.user_id.map(|user_id| {
            let mut map = HashMap::new();
            map.insert("user_id".to_string(), Value::String(user_id));
            map
        })
    });

    let mut converted = ChatRequest {
        model: request.model,
        messages,
        tools,
        tool_choice,
        temperature: request.temperature,
        max_tokens: Some(request.max_tokens),
        top_p: request.top_p,
        stop: request.stop_sequences.map(StopSequences::Many),
        response_format: None,
        stream: request.stream,
        metadata,
    };

    converted.normalize();
    Ok(converted)
}

fn convert_message(
    message: AnthropicMessage,
    out: &mut Vec<ChatMessage>,
    known_tool_use_ids: &mut HashSet<String>,
) -> ProxyResult<()> {
    let role = match message.role {
        AnthropicRole::User => ChatRole::User,
        AnthropicRole::Assistant => ChatRole::Assistant,
    };

    match message.content {
        AnthropicContent::Text(text) => {
            out.push(ChatMessage::text(role, text));
        }
        AnthropicContent::Blocks(blocks) => {
            let mut text = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text: fragment } => text.push_str(&fragment),
                    ContentBlock::ToolUse { id, name, input } => {
                        known_tool_use_ids.insert(id.clone());
                        tool_calls.push(ToolCall {
                            id,
                            tool_type: "function".to_string(),
                            function: FunctionCall {
                                name,
                                arguments: input.to_string(),
                            },
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error: _,
                    } => {
                        if !known_tool_use_ids.contains(&tool_use_id) {
                            return Err(ProxyError::InvalidRequest(format!(
                                "tool_result references unknown tool_use id '{tool_use_id}'"
                            )));
                        }

                        // Tool results become their own messages so ordering
                        // against surrounding text survives the conversion.
                        out.push(ChatMessage {
                            role: ChatRole::Tool,
                            content: Some(MessageContent::Text(
                                content.map(|content| content.flatten()).unwrap_or_default(),
                            )),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id),
                        });
                    }
                    // Thinking blocks are model output echoed back by the
                    // client; they carry no instruction for the backend.
                    ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
                }
            }

            if !text.is_empty() || !tool_calls.is_empty() {
                out.push(ChatMessage {
                    role,
                    content: if text.is_empty() {
                        None
                    } else {
                        Some(MessageContent::Text(text))
                    },
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    tool_call_id: None,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::messages::openai::FinishReason;

    fn request_from_json(value: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn system_string_becomes_leading_system_message() {
        let request = request_from_json(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 64,
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let converted = chat_request_from_messages(request).unwrap();

        assert_eq!(converted.messages.len(), 2);
        assert_eq!(converted.messages[0].role, ChatRole::System);
        assert_eq!(converted.messages[0].content_text(), "be brief");
        assert_eq!(converted.messages[1].role, ChatRole::User);
        assert_eq!(converted.max_tokens, Some(64));
    }

    #[test]
    fn tool_use_and_result_split_into_tool_calls_and_tool_messages() {
        let request = request_from_json(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": "look this up"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "t"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found"}
                ]}
            ]
        }));

        let converted = chat_request_from_messages(request).unwrap();

        assert_eq!(converted.messages.len(), 3);

        let assistant = &converted.messages[1];
        assert_eq!(assistant.role, ChatRole::Assistant);
        assert_eq!(assistant.content_text(), "checking");
        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap(),
            json!({"q": "t"})
        );

        let tool = &converted.messages[2];
        assert_eq!(tool.role, ChatRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(tool.content_text(), "found");
    }

    #[test]
    fn unknown_tool_result_id_is_invalid_request() {
        let request = request_from_json(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_missing", "content": "?"}
                ]}
            ]
        }));

        let error = chat_request_from_messages(request).unwrap_err();
        assert!(matches!(error, ProxyError::InvalidRequest(_)), "{error}");
        assert!(error.to_string().contains("toolu_missing"));
    }

    #[test]
    fn duplicate_tools_are_deduplicated_last_wins() {
        let request = request_from_json(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"name": "search", "input_schema": {"v": 1}},
                {"name": "search", "input_schema": {"v": 2}}
            ]
        }));

        let converted = chat_request_from_messages(request).unwrap();
        let tools = converted.tools.unwrap();

        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.parameters, json!({"v": 2}));
    }

    #[test]
    fn round_trip_preserves_user_visible_content() {
        let request = request_from_json(json!({
            "model": "m",
            "max_tokens": 64,
            "system": "sys",
            "messages": [
                {"role": "user", "content": "question"},
                {"role": "assistant", "content": [{"type": "text", "text": "answer"}]}
            ],
            "stop_sequences": ["END"],
            "temperature": 0.5
        }));

        let converted = chat_request_from_messages(request).unwrap();
        let back = crate::convert::to_anthropic::messages_request_from_chat(converted);

        assert_eq!(back.system.unwrap().flatten(), "sys");
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.messages[0].role, AnthropicRole::User);
        assert_eq!(back.messages[1].role, AnthropicRole::Assistant);
        assert_eq!(back.stop_sequences.unwrap(), vec!["END".to_string()]);
        assert_eq!(back.temperature, Some(0.5));
    }

    #[test]
    fn finish_reason_table_round_trips() {
        use crate::convert::{finish_reason_from_stop, stop_reason_from_finish};
        use crate::messages::anthropic::StopReason;

        let table = [
            (FinishReason::Stop, StopReason::EndTurn),
            (FinishReason::Length, StopReason::MaxTokens),
            (FinishReason::ToolCalls, StopReason::ToolUse),
            (FinishReason::ContentFilter, StopReason::StopSequence),
        ];

        for (finish, stop) in table {
            assert_eq!(stop_reason_from_finish(&finish), stop);
        }

        assert_eq!(finish_reason_from_stop(&StopReason::EndTurn), FinishReason::Stop);
        assert_eq!(finish_reason_from_stop(&StopReason::StopSequence), FinishReason::Stop);
        assert_eq!(finish_reason_from_stop(&StopReason::Refusal), FinishReason::ContentFilter);
    }
}
