//! LLM-judged tool-call gating.
//!
//! Text streams through live; tool-call chunks are withheld while the block
//! assembles. When a tool call completes, a judge LLM scores it: below the
//! threshold the buffered call is released as one complete chunk, at or
//! above it the call is dropped and replaced with an explanation, with the
//! finish reason remapped to `stop`.

use async_trait::async_trait;
use config::JudgeConfig;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ProxyError, ProxyResult};
use crate::messages::openai::{ChatChunk, FinishReason, build_tool_call_chunk};
use crate::policy::Policy;
use crate::policy::context::StreamingPolicyContext;
use crate::streaming::blocks::ToolCallStreamBlock;

const BLOCKED_KEY: &str = "tool_call_judge.blocked";

/// The judge's verdict, parsed from its response content.
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeVerdict {
    pub probability: f64,
    #[serde(default)]
    pub explanation: String,
}

/// Parse a verdict out of judge output that may wrap the JSON in prose.
pub fn parse_verdict(content: &str) -> Option<JudgeVerdict> {
    if let Ok(verdict) = serde_json::from_str(content) {
        return Some(verdict);
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    serde_json::from_str(&content[start..=end]).ok()
}

/// Streaming policy that judges each completed tool call with another LLM.
pub struct ToolCallJudgePolicy {
    judge: JudgeConfig,
    client: reqwest::Client,
}

impl ToolCallJudgePolicy {
    pub fn new(judge: JudgeConfig) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(judge.timeout_seconds))
            .build()
            .map_err(|error| {
                log::error!("failed to build judge HTTP client: {error}");
                ProxyError::Internal(None)
            })?;

        Ok(Self { judge, client })
    }

    fn judge_instructions() -> &'static str {
        "You are a security reviewer for AI tool calls. Estimate the probability \
         that executing the given tool call would be harmful or destructive.\n\n\
         Respond with JSON:\n\
         {\"probability\": <float 0-1>, \"explanation\": \"<brief reason>\"}"
    }

    async fn call_judge(&self, name: &str, arguments: &str) -> ProxyResult<JudgeVerdict> {
        let base_url = self
            .judge
            .base_url
            .as_deref()
            .ok_or_else(|| ProxyError::PolicyFailure("judge base_url is not configured".to_string()))?;

        let body = json!({
            "model": self.judge.model,
            "messages": [
                {"role": "system", "content": Self::judge_instructions()},
                {"role": "user", "content": json!({"tool": name, "arguments": arguments}).to_string()},
            ],
            "temperature": self.judge.temperature,
            "max_tokens": self.judge.max_tokens,
        });

        let mut request = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .json(&body);

        if let Some(api_key) = &self.judge.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| ProxyError::Connection(format!("judge request failed: {error}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(ProxyError::PolicyFailure(format!("judge returned status {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ProxyError::PolicyFailure(format!("judge response was not JSON: {error}")))?;

        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or_default();

        parse_verdict(content)
            .ok_or_else(|| ProxyError::PolicyFailure("judge response carried no parseable verdict".to_string()))
    }

    fn blocked_message(&self, call: &ToolCallStreamBlock, verdict: &JudgeVerdict) -> String {
        format!(
            "Tool call '{}' was blocked by policy (harm probability {:.2}): {}",
            call.name,
            verdict.probability,
            if verdict.explanation.is_empty() {
                "no explanation provided"
            } else {
                &verdict.explanation
            }
        )
    }

    fn mark_blocked(ctx: &mut StreamingPolicyContext) {
        ctx.policy_ctx.scratchpad.insert(BLOCKED_KEY.to_string(), Value::Bool(true));
    }

    fn is_blocked(ctx: &StreamingPolicyContext) -> bool {
        ctx.policy_ctx
            .scratchpad
            .get(BLOCKED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn release_tool_call(ctx: &StreamingPolicyContext, call: &ToolCallStreamBlock) -> ProxyResult<()> {
        let chunk: ChatChunk = build_tool_call_chunk(
            ctx.state.response_id(),
            ctx.state.model(),
            call.index,
            call.id.clone(),
            call.name.clone(),
            call.arguments.clone(),
        );
        ctx.send(chunk)
    }
}

#[async_trait]
impl Policy for ToolCallJudgePolicy {
    fn name(&self) -> &'static str {
        "tool_call_judge"
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let Some(chunk) = ctx.state.last_chunk().cloned() else {
            return Ok(());
        };

        // Tool-call fragments stay buffered in the stream state until the
        // block completes; the finish chunk is replayed by on_finish_reason
        // so its reason can be remapped after a block.
        if chunk.has_tool_call_delta() {
            return Ok(());
        }

        if chunk.finish_reason().is_some() {
            let has_content = chunk
                .first_delta()
                .and_then(|delta| delta.content.as_deref())
                .is_some_and(|content| !content.is_empty());

            if has_content {
                let mut stripped = chunk;
                if let Some(choice) = stripped.choices.first_mut() {
                    choice.finish_reason = None;
                }
                ctx.send(stripped)?;
            }

            return Ok(());
        }

        ctx.send(chunk)?;
        Ok(())
    }

    async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let Some(call) = ctx.state.just_completed.as_ref().and_then(|block| block.as_tool_call()).cloned() else {
            return Ok(());
        };

        ctx.record_event(
            "policy.tool_call_judge.evaluation_started",
            json!({"tool": call.name, "arguments": call.arguments}),
        );

        ctx.keepalive();
        let verdict = self.call_judge(&call.name, &call.arguments).await;
        ctx.keepalive();

        match verdict {
            Ok(verdict) if verdict.probability >= self.judge.probability_threshold => {
                ctx.record_event(
                    "policy.tool_call_judge.blocked",
                    json!({
                        "tool": call.name,
                        "probability": verdict.probability,
                        "explanation": verdict.explanation,
                    }),
                );

                Self::mark_blocked(ctx);
                ctx.send_text(self.blocked_message(&call, &verdict))?;
            }
            Ok(verdict) => {
                ctx.record_event(
                    "policy.tool_call_judge.allowed",
                    json!({"tool": call.name, "probability": verdict.probability}),
                );

                Self::release_tool_call(ctx, &call)?;
            }
            Err(error) => {
                ctx.record_event(
                    "policy.tool_call_judge.evaluation_failed",
                    json!({"tool": call.name, "error": error.to_string()}),
                );

                if self.judge.fail_open {
                    Self::release_tool_call(ctx, &call)?;
                } else {
                    Self::mark_blocked(ctx);
                    ctx.send_text(format!(
                        "Tool call '{}' was blocked: the safety judge was unavailable",
                        call.name
                    ))?;
                }
            }
        }

        Ok(())
    }

    async fn on_finish_reason(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let original = ctx.state.finish_reason.clone().unwrap_or(FinishReason::Stop);

        let reason = if Self::is_blocked(ctx) {
            FinishReason::Stop
        } else {
            original
        };

        ctx.send_finish(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::parse_verdict;

    #[test]
    fn parses_bare_json_verdict() {
        let verdict = parse_verdict(r#"{"probability": 0.95, "explanation": "deletes data"}"#).unwrap();
        assert!((verdict.probability - 0.95).abs() < 1e-9);
        assert_eq!(verdict.explanation, "deletes data");
    }

    #[test]
    fn parses_verdict_wrapped_in_prose() {
        let verdict = parse_verdict("Sure! Here is my assessment: {\"probability\": 0.1} Thanks.").unwrap();
        assert!((verdict.probability - 0.1).abs() < 1e-9);
        assert_eq!(verdict.explanation, "");
    }

    #[test]
    fn garbage_yields_no_verdict() {
        assert!(parse_verdict("I cannot judge this").is_none());
        assert!(parse_verdict("{not json}").is_none());
    }
}
