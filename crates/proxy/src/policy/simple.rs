//! Block-level policy adapter.
//!
//! Many policies only care about whole blocks, not individual deltas.
//! [`SimplePolicy`] wraps a [`BlockPolicy`] and handles the buffering: it
//! withholds every chunk, waits for the assembler to complete a block, hands
//! the aggregate to the wrapped hooks, and emits whatever they return as one
//! chunk. Composition over inheritance: the wrapper is itself a [`Policy`].

use async_trait::async_trait;

use crate::error::ProxyResult;
use crate::messages::openai::{FinishReason, build_tool_call_chunk};
use crate::policy::Policy;
use crate::policy::context::StreamingPolicyContext;
use crate::streaming::blocks::{StreamBlock, ToolCallStreamBlock};

/// Block-level hooks. Return `None` to drop a block entirely.
#[async_trait]
pub trait BlockPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// A complete text block. The returned string is emitted as one chunk.
    async fn on_text_block(&self, text: String, ctx: &mut StreamingPolicyContext) -> ProxyResult<Option<String>> {
        let _ = ctx;
        Ok(Some(text))
    }

    /// A complete tool call. The returned call is emitted as one chunk.
    async fn on_tool_call_block(
        &self,
        call: ToolCallStreamBlock,
        ctx: &mut StreamingPolicyContext,
    ) -> ProxyResult<Option<ToolCallStreamBlock>> {
        let _ = ctx;
        Ok(Some(call))
    }
}

/// Adapter turning a [`BlockPolicy`] into a chunk-level [`Policy`].
pub struct SimplePolicy<P> {
    inner: P,
}

impl<P: BlockPolicy> SimplePolicy<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    async fn emit_block(&self, block: StreamBlock, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        match block {
            StreamBlock::Content(content) => {
                if let Some(text) = self.inner.on_text_block(content.text, ctx).await? {
                    ctx.send_text(text)?;
                }
            }
            StreamBlock::ToolCall(call) => {
                if let Some(call) = self.inner.on_tool_call_block(call, ctx).await? {
                    ctx.send(build_tool_call_chunk(
                        ctx.state.response_id(),
                        ctx.state.model(),
                        call.index,
                        call.id,
                        call.name,
                        call.arguments,
                    ))?;
                }
            }
            // Thinking blocks pass through unseen by block policies.
            StreamBlock::Thinking(_) => {}
        }

        Ok(())
    }
}

#[async_trait]
impl<P: BlockPolicy> Policy for SimplePolicy<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn on_content_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        if let Some(block) = ctx.state.just_completed.clone() {
            self.emit_block(block, ctx).await?;
        }
        Ok(())
    }

    async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        if let Some(block) = ctx.state.just_completed.clone() {
            self.emit_block(block, ctx).await?;
        }
        Ok(())
    }

    async fn on_finish_reason(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        ctx.send_finish(ctx.state.finish_reason.clone().unwrap_or(FinishReason::Stop))
    }

    async fn on_stream_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
        // A stream that ends without a finish reason leaves its last block
        // open; flush it so the client still sees the text.
        if let Some(block) = ctx.state.current_block.take() {
            self.emit_block(block, ctx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use storage::EventSink;
    use tokio::sync::mpsc;

    use super::{BlockPolicy, SimplePolicy};
    use crate::error::ProxyResult;
    use crate::messages::openai::{ChatChunk, ChatRequest};
    use crate::observability::context::ObservabilityContext;
    use crate::observability::recorder::TransactionRecorder;
    use crate::policy::Policy;
    use crate::policy::context::{PolicyContext, StreamingPolicyContext};
    use crate::streaming::dispatcher;
    use crate::streaming::timeout::TimeoutMonitor;

    struct Shouting;

    #[async_trait]
    impl BlockPolicy for Shouting {
        fn name(&self) -> &'static str {
            "shouting"
        }

        async fn on_text_block(&self, text: String, _ctx: &mut StreamingPolicyContext) -> ProxyResult<Option<String>> {
            Ok(Some(text.to_uppercase()))
        }
    }

    fn content_chunk(text: &str) -> ChatChunk {
        serde_json::from_value(json!({
            "id": "r1", "model": "m",
            "choices": [{"index": 0, "delta": {"content": text}}]
        }))
        .unwrap()
    }

    fn finish_chunk() -> ChatChunk {
        serde_json::from_value(json!({
            "id": "r1", "model": "m",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn buffers_deltas_and_emits_one_transformed_block() {
        let (sink, _) = EventSink::in_memory();
        let obs = Arc::new(ObservabilityContext::new("call-1", None, sink));
        let request: Arc<ChatRequest> = Arc::new(
            serde_json::from_value(json!({"model": "m", "messages": []})).unwrap(),
        );

        let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let monitor = TimeoutMonitor::new(None);
        let mut ctx = StreamingPolicyContext::new(PolicyContext::new(obs.clone(), request), egress_tx, monitor.handle());
        let recorder = TransactionRecorder::new(obs, 512);

        let policy: Arc<dyn Policy> = Arc::new(SimplePolicy::new(Shouting));
        let input = futures::stream::iter(vec![
            Ok(content_chunk("hel")),
            Ok(content_chunk("lo")),
            Ok(finish_chunk()),
        ]);

        dispatcher::run(
            policy,
            &mut ctx,
            &mut egress_rx,
            Box::pin(input),
            &output_tx,
            &recorder,
            &monitor,
        )
        .await
        .unwrap();

        let mut texts = Vec::new();
        let mut finish = None;
        while let Some(Some(chunk)) = output_rx.recv().await {
            if let Some(text) = chunk.first_delta().and_then(|delta| delta.content.clone()) {
                texts.push(text);
            }
            if let Some(reason) = chunk.finish_reason() {
                finish = Some(reason.clone());
            }
        }

        assert_eq!(texts, vec!["HELLO".to_string()]);
        assert_eq!(finish, Some(crate::messages::openai::FinishReason::Stop));
    }
}
