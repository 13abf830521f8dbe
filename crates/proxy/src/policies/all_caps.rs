//! Uppercases assistant text. The smallest possible transforming policy,
//! useful for demonstrating that transformations actually flow end to end.

use async_trait::async_trait;

use crate::error::ProxyResult;
use crate::messages::openai::{ChatResponse, MessageContent};
use crate::policy::Policy;
use crate::policy::context::{PolicyContext, StreamingPolicyContext};

/// Uppercases content deltas in place and streams them straight through.
pub struct AllCapsPolicy;

#[async_trait]
impl Policy for AllCapsPolicy {
    fn name(&self) -> &'static str {
        "all_caps"
    }

    async fn on_response(&self, mut response: ChatResponse, _ctx: &mut PolicyContext) -> ProxyResult<ChatResponse> {
        for choice in &mut response.choices {
            if let Some(content) = &choice.message.content {
                choice.message.content = Some(MessageContent::Text(content.flatten().to_uppercase()));
            }
        }

        Ok(response)
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let Some(mut chunk) = ctx.state.last_chunk().cloned() else {
            return Ok(());
        };

        for choice in &mut chunk.choices {
            if let Some(content) = &mut choice.delta.content {
                *content = content.to_uppercase();
            }
        }

        ctx.send(chunk)?;
        Ok(())
    }
}
