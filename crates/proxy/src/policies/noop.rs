//! Lossless passthrough.

use async_trait::async_trait;

use crate::error::ProxyResult;
use crate::policy::Policy;
use crate::policy::context::StreamingPolicyContext;

/// Releases every chunk unchanged, as soon as it arrives.
pub struct NoOpPolicy;

#[async_trait]
impl Policy for NoOpPolicy {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        if let Some(chunk) = ctx.state.last_chunk().cloned() {
            ctx.send(chunk)?;
        }

        Ok(())
    }
}
