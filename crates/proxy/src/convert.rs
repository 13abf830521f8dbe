//! Format adapters between the Anthropic dialect and the normalized
//! representation, for both requests and non-streaming responses.

pub(crate) mod from_anthropic;
pub(crate) mod to_anthropic;

use crate::messages::anthropic::StopReason;
use crate::messages::openai::FinishReason;

/// Normalized finish reason → Anthropic stop reason.
pub fn stop_reason_from_finish(finish: &FinishReason) -> StopReason {
    match finish {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::StopSequence,
        FinishReason::Other(other) => StopReason::Other(other.clone()),
    }
}

/// Anthropic stop reason → normalized finish reason.
pub fn finish_reason_from_stop(stop: &StopReason) -> FinishReason {
    match stop {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::Refusal => FinishReason::ContentFilter,
        StopReason::Other(other) => {
            log::warn!("Unknown stop reason from backend: {other}");
            FinishReason::Other(other.clone())
        }
    }
}
