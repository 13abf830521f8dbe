//! Find-and-replace over streaming text, correct across chunk boundaries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProxyResult;
use crate::policy::Policy;
use crate::policy::context::StreamingPolicyContext;

const PENDING_KEY: &str = "string_replacement.pending";

/// Configuration: a map of needle → replacement.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StringReplacementConfig {
    #[serde(default)]
    pub replacements: BTreeMap<String, String>,
}

/// Replaces configured strings in streamed text.
///
/// A needle may span chunk boundaries, so the policy holds back the last
/// `longest_needle - 1` characters of transformed text until more arrives,
/// flushing the remainder when the stream finishes.
pub struct StringReplacementPolicy {
    replacements: Vec<(String, String)>,
    holdback: usize,
}

impl StringReplacementPolicy {
    pub fn new(config: StringReplacementConfig) -> Self {
        let holdback = config
            .replacements
            .keys()
            .map(|needle| needle.chars().count())
            .max()
            .unwrap_or(1)
            .saturating_sub(1);

        Self {
            replacements: config.replacements.into_iter().collect(),
            holdback,
        }
    }

    fn apply(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (needle, replacement) in &self.replacements {
            result = result.replace(needle, replacement);
        }
        result
    }

    fn pending(ctx: &StreamingPolicyContext) -> String {
        ctx.policy_ctx
            .scratchpad
            .get(PENDING_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn set_pending(ctx: &mut StreamingPolicyContext, pending: String) {
        ctx.policy_ctx
            .scratchpad
            .insert(PENDING_KEY.to_string(), Value::String(pending));
    }

    /// Flush whatever is still held back, applying replacements one last time.
    fn flush(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let pending = Self::pending(ctx);
        if pending.is_empty() {
            return Ok(());
        }

        Self::set_pending(ctx, String::new());
        ctx.send_text(self.apply(&pending))
    }
}

/// Split off everything but the last `holdback` characters, on a char
/// boundary.
fn split_for_holdback(text: &str, holdback: usize) -> (&str, &str) {
    let total = text.chars().count();
    if total <= holdback {
        return ("", text);
    }

    let emit_chars = total - holdback;
    let boundary = text
        .char_indices()
        .nth(emit_chars)
        .map(|(index, _)| index)
        .unwrap_or(text.len());

    text.split_at(boundary)
}

#[async_trait]
impl Policy for StringReplacementPolicy {
    fn name(&self) -> &'static str {
        "string_replacement"
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let Some(chunk) = ctx.state.last_chunk().cloned() else {
            return Ok(());
        };

        let content = chunk.first_delta().and_then(|delta| delta.content.clone());

        match content.filter(|content| !content.is_empty()) {
            Some(content) => {
                let combined = self.apply(&(Self::pending(ctx) + &content));

                // A finish on the same chunk means nothing more is coming;
                // release the whole window with it.
                let (emit, keep) = if chunk.finish_reason().is_some() {
                    (combined.as_str(), "")
                } else {
                    split_for_holdback(&combined, self.holdback)
                };

                let emit = emit.to_string();
                Self::set_pending(ctx, keep.to_string());

                if !emit.is_empty() || chunk.finish_reason().is_some() {
                    let mut transformed = chunk;
                    if let Some(choice) = transformed.choices.first_mut() {
                        choice.delta.content = Some(emit);
                    }
                    ctx.send(transformed)?;
                }
            }
            None => {
                // Anything held back goes out before a finish chunk passes.
                if chunk.finish_reason().is_some() {
                    self.flush(ctx)?;
                }
                ctx.send(chunk)?;
            }
        }

        Ok(())
    }

    async fn on_stream_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        self.flush(ctx)
    }
}
