//! Pattern-matching guard against self-destructive shell commands.
//!
//! Protects the proxy from being killed by the agent running through it.
//! Pure regex: zero latency, no LLM dependency, deterministic.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ProxyError, ProxyResult};
use crate::messages::openai::{ChatMessage, ChatResponse, ChatRole, FinishReason, MessageContent};
use crate::policy::Policy;
use crate::policy::context::{PolicyContext, StreamingPolicyContext};
use crate::streaming::blocks::ToolCallStreamBlock;

const BLOCKED_KEY: &str = "dogfood_safety.blocked";

const DEFAULT_DANGEROUS_PATTERNS: &[&str] = &[
    r"docker\s+(compose\s+)?(down|stop|kill|rm|restart)",
    r"docker-compose\s+(down|stop|kill|rm|restart)",
    r"pkill\s+.*luthien",
    r"kill\s+-9",
    r"systemctl\s+(stop|restart|disable)",
    r"rm\s+-rf?\s+/",
];

const DEFAULT_TOOL_NAMES: &[&str] = &["bash", "shell", "run_shell_command", "execute_command", "terminal"];

/// Configuration for [`DogfoodSafetyPolicy`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DogfoodSafetyConfig {
    /// Regex patterns to block in shell tool-call arguments.
    pub blocked_patterns: Vec<String>,
    /// Tool names considered shell executors.
    pub tool_names: Vec<String>,
    /// Message template; `{command}` is substituted.
    pub blocked_message: String,
}

impl Default for DogfoodSafetyConfig {
    fn default() -> Self {
        Self {
            blocked_patterns: DEFAULT_DANGEROUS_PATTERNS.iter().map(|s| s.to_string()).collect(),
            tool_names: DEFAULT_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
            blocked_message: "Blocked: '{command}' would disrupt the proxy infrastructure. \
                              Run infrastructure commands from a separate terminal."
                .to_string(),
        }
    }
}

/// Blocks shell tool calls whose command matches a configured pattern.
pub struct DogfoodSafetyPolicy {
    patterns: Vec<regex::Regex>,
    tool_names: HashSet<String>,
    blocked_message: String,
}

impl DogfoodSafetyPolicy {
    pub fn new(config: DogfoodSafetyConfig) -> ProxyResult<Self> {
        let patterns = config
            .blocked_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|error| ProxyError::InvalidRequest(format!("invalid blocked pattern '{pattern}': {error}")))
            })
            .collect::<ProxyResult<Vec<_>>>()?;

        Ok(Self {
            patterns,
            tool_names: config.tool_names.iter().map(|name| name.to_lowercase()).collect(),
            blocked_message: config.blocked_message,
        })
    }

    /// (blocked, command) for a tool call.
    fn screen(&self, name: &str, arguments: &str) -> (bool, String) {
        if !self.tool_names.contains(&name.to_lowercase()) {
            return (false, String::new());
        }

        let command = extract_command(arguments);
        if command.is_empty() {
            return (false, String::new());
        }

        let blocked = self.patterns.iter().any(|pattern| pattern.is_match(&command));
        (blocked, command)
    }

    fn format_blocked_message(&self, command: &str) -> String {
        let truncated: String = command.chars().take(200).collect();
        self.blocked_message.replace("{command}", &truncated)
    }
}

/// Pull the command string out of tool arguments, tolerating both JSON
/// objects and raw strings.
fn extract_command(arguments: &str) -> String {
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => map.get("command").and_then(Value::as_str).unwrap_or_default().to_string(),
        Ok(Value::String(command)) => command,
        _ => arguments.to_string(),
    }
}

#[async_trait]
impl Policy for DogfoodSafetyPolicy {
    fn name(&self) -> &'static str {
        "dogfood_safety"
    }

    async fn on_response(&self, response: ChatResponse, ctx: &mut PolicyContext) -> ProxyResult<ChatResponse> {
        let Some(choice) = response.choices.first() else {
            return Ok(response);
        };

        let Some(calls) = &choice.message.tool_calls else {
            return Ok(response);
        };

        for call in calls {
            let (blocked, command) = self.screen(&call.function.name, &call.function.arguments);
            if blocked {
                ctx.record_event(
                    "policy.dogfood_safety.blocked",
                    json!({
                        "tool_name": call.function.name,
                        "command": command.chars().take(200).collect::<String>(),
                    }),
                );

                let mut replaced = response.clone();
                replaced.choices = vec![crate::messages::openai::ChatChoice {
                    index: Some(0),
                    message: ChatMessage {
                        role: ChatRole::Assistant,
                        content: Some(MessageContent::Text(self.format_blocked_message(&command))),
                        tool_calls: None,
                        tool_call_id: None,
                    },
                    finish_reason: Some(FinishReason::Stop),
                }];

                return Ok(replaced);
            }
        }

        Ok(response)
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let Some(chunk) = ctx.state.last_chunk().cloned() else {
            return Ok(());
        };

        // Same gate shape as the judge policy: tool fragments buffer in the
        // stream state, finish replays through on_finish_reason.
        if chunk.has_tool_call_delta() {
            return Ok(());
        }

        if chunk.finish_reason().is_some() {
            return Ok(());
        }

        ctx.send(chunk)?;
        Ok(())
    }

    async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let Some(call) = ctx
            .state
            .just_completed
            .as_ref()
            .and_then(|block| block.as_tool_call())
            .cloned()
        else {
            return Ok(());
        };

        let (blocked, command) = self.screen(&call.name, &call.arguments);

        if blocked {
            ctx.record_event(
                "policy.dogfood_safety.blocked",
                json!({
                    "tool_name": call.name,
                    "command": command.chars().take(200).collect::<String>(),
                }),
            );

            ctx.policy_ctx
                .scratchpad
                .insert(BLOCKED_KEY.to_string(), Value::Bool(true));
            ctx.send_text(self.format_blocked_message(&command))?;
        } else {
            release_tool_call(ctx, &call)?;
        }

        Ok(())
    }

    async fn on_finish_reason(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let blocked = ctx
            .policy_ctx
            .scratchpad
            .get(BLOCKED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let reason = if blocked {
            FinishReason::Stop
        } else {
            ctx.state.finish_reason.clone().unwrap_or(FinishReason::Stop)
        };

        ctx.send_finish(reason)
    }
}

fn release_tool_call(ctx: &StreamingPolicyContext, call: &ToolCallStreamBlock) -> ProxyResult<()> {
    ctx.send(crate::messages::openai::build_tool_call_chunk(
        ctx.state.response_id(),
        ctx.state.model(),
        call.index,
        call.id.clone(),
        call.name.clone(),
        call.arguments.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::{DogfoodSafetyConfig, DogfoodSafetyPolicy, extract_command};

    fn policy() -> DogfoodSafetyPolicy {
        DogfoodSafetyPolicy::new(DogfoodSafetyConfig::default()).unwrap()
    }

    #[test]
    fn blocks_docker_down_in_bash_tool() {
        let (blocked, command) = policy().screen("bash", r#"{"command": "docker compose down"}"#);
        assert!(blocked);
        assert_eq!(command, "docker compose down");
    }

    #[test]
    fn ignores_non_shell_tools() {
        let (blocked, _) = policy().screen("search", r#"{"command": "docker compose down"}"#);
        assert!(!blocked);
    }

    #[test]
    fn allows_innocent_commands() {
        let (blocked, _) = policy().screen("bash", r#"{"command": "ls -la"}"#);
        assert!(!blocked);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let (blocked, _) = policy().screen("Bash", r#"{"command": "DOCKER STOP luthien"}"#);
        assert!(blocked);
    }

    #[test]
    fn extract_command_handles_raw_strings() {
        assert_eq!(extract_command("pkill -f luthien"), "pkill -f luthien");
        assert_eq!(extract_command(r#"{"command": "ls"}"#), "ls");
        assert_eq!(extract_command(r#""docker stop x""#), "docker stop x");
    }

    #[test]
    fn blocked_message_substitutes_command() {
        let message = policy().format_blocked_message("docker stop proxy");
        assert!(message.contains("docker stop proxy"));
    }
}
