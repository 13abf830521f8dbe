//! The policy hook interface and its execution contexts.
//!
//! A policy is a user-configured set of hooks invoked at request,
//! non-streaming response, and streaming lifecycle points. Policy instances
//! are shared across concurrent transactions: all per-request mutable state
//! lives in the contexts, chiefly the scratchpad and the stream state.

pub(crate) mod context;
pub(crate) mod manager;
pub(crate) mod registry;
pub(crate) mod simple;

use async_trait::async_trait;

use crate::error::ProxyResult;
use crate::messages::openai::{ChatRequest, ChatResponse};
use crate::policy::context::{PolicyContext, StreamingPolicyContext};

/// The fixed hook interface every policy implements.
///
/// Streaming hooks fire in a fixed order per chunk: `on_chunk_received`
/// always; then the delta hook matching the open block; then the complete
/// hook when a block just finished; then `on_finish_reason` when the chunk
/// carried one. `on_stream_complete` runs once after the upstream is
/// exhausted, and `on_streaming_policy_complete` runs on every exit path.
///
/// Policies emit output only by pushing chunks onto the egress queue through
/// the streaming context; returning an error from any hook aborts the
/// transaction after cleanup.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Short name used in logs and events.
    fn name(&self) -> &'static str;

    /// Inspect or rewrite the request before it reaches the backend.
    async fn on_request(&self, request: ChatRequest, ctx: &mut PolicyContext) -> ProxyResult<ChatRequest> {
        let _ = ctx;
        Ok(request)
    }

    /// Inspect or rewrite a complete non-streaming response.
    async fn on_response(&self, response: ChatResponse, ctx: &mut PolicyContext) -> ProxyResult<ChatResponse> {
        let _ = ctx;
        Ok(response)
    }

    /// Every chunk, before any block-level hook.
    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// A content block is open after this chunk.
    async fn on_content_delta(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// A tool-call block is open after this chunk.
    async fn on_tool_call_delta(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// A content block completed on this chunk.
    async fn on_content_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// A tool-call block completed on this chunk.
    async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// This chunk carried a finish reason.
    async fn on_finish_reason(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// The upstream iterator is exhausted; last chance to flush output.
    async fn on_stream_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Cleanup. Runs on every exit path, including errors and timeouts.
    async fn on_streaming_policy_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Session-end hook, run when this policy is hot-swapped out.
    async fn on_deactivate(&self) {}
}

impl std::fmt::Debug for dyn Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy").field("name", &self.name()).finish()
    }
}
