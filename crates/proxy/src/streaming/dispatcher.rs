//! The policy-hook dispatcher: drives a policy through the fixed hook order
//! per chunk, drains the egress queue, and races a timeout monitor.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::{ProxyError, ProxyResult};
use crate::messages::openai::ChatChunk;
use crate::observability::recorder::TransactionRecorder;
use crate::policy::Policy;
use crate::policy::context::StreamingPolicyContext;
use crate::streaming::ChunkStream;
use crate::streaming::assembler;
use crate::streaming::blocks::StreamBlock;
use crate::streaming::timeout::TimeoutMonitor;

/// Bounded wait for output-queue writes. Long enough that a healthy client
/// never hits it, short enough to break a deadlock with a stalled consumer.
const QUEUE_PUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Write to the output queue with the bounded wait.
async fn safe_send(output: &mpsc::Sender<Option<ChatChunk>>, item: Option<ChatChunk>) -> ProxyResult<()> {
    match tokio::time::timeout(QUEUE_PUT_TIMEOUT, output.send(item)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(ProxyError::StreamClosed),
        Err(_) => {
            log::error!(
                "output queue put timed out after {}s; downstream consumer stalled",
                QUEUE_PUT_TIMEOUT.as_secs()
            );
            Err(ProxyError::StreamStalled)
        }
    }
}

/// Move everything the policy released onto the output queue.
async fn drain_egress(
    egress: &mut mpsc::UnboundedReceiver<ChatChunk>,
    recorder: &TransactionRecorder,
    output: &mpsc::Sender<Option<ChatChunk>>,
) -> ProxyResult<()> {
    while let Ok(chunk) = egress.try_recv() {
        recorder.add_egress_chunk(&chunk);
        safe_send(output, Some(chunk)).await?;
    }

    Ok(())
}

/// Run a policy over an upstream chunk stream.
///
/// Per chunk, in fixed order: absorb into the stream state, then
/// `on_chunk_received`, the delta hook for the open block, the complete hook
/// for a just-completed block, and `on_finish_reason` when the chunk carried
/// one; afterwards the egress queue is drained to the output queue. On the
/// success path `on_stream_complete` runs once and the egress queue drains a
/// final time.
///
/// The whole loop races the timeout monitor: if the deadline set by
/// `keepalive()` expires first the loop future is dropped and the
/// transaction surfaces [`ProxyError::PolicyTimeout`]. On every exit path
/// the cleanup hook runs and a `None` sentinel lands on the output queue;
/// hook errors propagate without being masked by either.
pub async fn run(
    policy: Arc<dyn Policy>,
    ctx: &mut StreamingPolicyContext,
    egress: &mut mpsc::UnboundedReceiver<ChatChunk>,
    input: ChunkStream,
    output: &mpsc::Sender<Option<ChatChunk>>,
    recorder: &TransactionRecorder,
    monitor: &TimeoutMonitor,
) -> ProxyResult<()> {
    let keepalive = monitor.handle();

    let result = {
        let process = process_stream(&*policy, ctx, egress, input, output, recorder, &keepalive);
        tokio::pin!(process);

        tokio::select! {
            result = &mut process => result,
            seconds = monitor.expired() => Err(ProxyError::PolicyTimeout { seconds }),
        }
    };

    if let Err(error) = policy.on_streaming_policy_complete(ctx).await {
        log::error!("error in on_streaming_policy_complete, ignoring: {error}");
    }

    // Sentinel on every exit path; a closed queue means the consumer is
    // already gone and the result below carries the real outcome.
    if let Err(error) = safe_send(output, None).await {
        log::debug!("failed to push end-of-stream sentinel: {error}");
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn process_stream(
    policy: &dyn Policy,
    ctx: &mut StreamingPolicyContext,
    egress: &mut mpsc::UnboundedReceiver<ChatChunk>,
    mut input: ChunkStream,
    output: &mpsc::Sender<Option<ChatChunk>>,
    recorder: &TransactionRecorder,
    keepalive: &crate::streaming::timeout::KeepaliveHandle,
) -> ProxyResult<()> {
    while let Some(item) = input.next().await {
        let chunk = item?;

        keepalive.keepalive();
        recorder.add_ingress_chunk(&chunk);

        let chunk_finish = chunk.finish_reason().cloned();
        assembler::absorb(&mut ctx.state, chunk);

        policy.on_chunk_received(ctx).await?;

        match &ctx.state.current_block {
            Some(StreamBlock::Content(_)) => policy.on_content_delta(ctx).await?,
            Some(StreamBlock::ToolCall(_)) => policy.on_tool_call_delta(ctx).await?,
            Some(StreamBlock::Thinking(_)) | None => {}
        }

        match &ctx.state.just_completed {
            Some(StreamBlock::Content(_)) => policy.on_content_complete(ctx).await?,
            Some(StreamBlock::ToolCall(_)) => policy.on_tool_call_complete(ctx).await?,
            Some(StreamBlock::Thinking(_)) | None => {}
        }

        if chunk_finish.is_some() {
            policy.on_finish_reason(ctx).await?;
        }

        drain_egress(egress, recorder, output).await?;
    }

    policy.on_stream_complete(ctx).await?;
    drain_egress(egress, recorder, output).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use storage::EventSink;
    use tokio::sync::mpsc;

    use super::run;
    use crate::error::{ProxyError, ProxyResult};
    use crate::messages::openai::{ChatChunk, ChatRequest};
    use crate::observability::context::ObservabilityContext;
    use crate::observability::recorder::TransactionRecorder;
    use crate::policy::Policy;
    use crate::policy::context::{PolicyContext, StreamingPolicyContext};
    use crate::streaming::timeout::TimeoutMonitor;

    fn request() -> Arc<ChatRequest> {
        Arc::new(
            serde_json::from_value(json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .unwrap(),
        )
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

    struct Harness {
        ctx: StreamingPolicyContext,
        egress: mpsc::UnboundedReceiver<ChatChunk>,
        output_tx: mpsc::Sender<Option<ChatChunk>>,
        output_rx: mpsc::Receiver<Option<ChatChunk>>,
        recorder: TransactionRecorder,
    }

    fn harness() -> Harness {
        let (sink, _events) = EventSink::in_memory();
        let obs = Arc::new(ObservabilityContext::new("call-1", None, sink));
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(64);
        let monitor = TimeoutMonitor::new(None);

        Harness {
            ctx: StreamingPolicyContext::new(PolicyContext::new(obs.clone(), request()), egress_tx, monitor.handle()),
            egress: egress_rx,
            output_tx,
            output_rx,
            recorder: TransactionRecorder::new(obs, 512),
        }
    }

    /// Records the hook invocation order; passes chunks through.
    struct HookOrderPolicy {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Policy for HookOrderPolicy {
        fn name(&self) -> &'static str {
            "hook_order"
        }

        async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("chunk_received");
            if let Some(chunk) = ctx.state.last_chunk().cloned() {
                ctx.send(chunk)?;
            }
            Ok(())
        }

        async fn on_content_delta(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("content_delta");
            Ok(())
        }

        async fn on_content_complete(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("content_complete");
            Ok(())
        }

        async fn on_finish_reason(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("finish_reason");
            Ok(())
        }

        async fn on_stream_complete(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("stream_complete");
            Ok(())
        }

        async fn on_streaming_policy_complete(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("policy_complete");
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_fire_in_canonical_order() {
        let mut h = harness();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let policy = Arc::new(HookOrderPolicy { calls: Arc::clone(&calls) });

        let input = futures::stream::iter(vec![Ok(content_chunk("hi")), Ok(finish_chunk())]);
        let monitor = TimeoutMonitor::new(None);

        run(
            policy,
            &mut h.ctx,
            &mut h.egress,
            Box::pin(input),
            &h.output_tx,
            &h.recorder,
            &monitor,
        )
        .await
        .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "chunk_received",
                "content_delta",
                "chunk_received",
                "content_complete",
                "finish_reason",
                "stream_complete",
                "policy_complete",
            ]
        );
    }

    #[tokio::test]
    async fn passthrough_preserves_chunk_order_and_terminates_with_sentinel() {
        let mut h = harness();
        let policy = Arc::new(HookOrderPolicy {
            calls: Arc::default(),
        });

        let input = futures::stream::iter(vec![
            Ok(content_chunk("a")),
            Ok(content_chunk("b")),
            Ok(finish_chunk()),
        ]);
        let monitor = TimeoutMonitor::new(None);

        run(
            policy,
            &mut h.ctx,
            &mut h.egress,
            Box::pin(input),
            &h.output_tx,
            &h.recorder,
            &monitor,
        )
        .await
        .unwrap();

        let mut contents = Vec::new();
        while let Some(item) = h.output_rx.recv().await {
            match item {
                Some(chunk) => contents.push(chunk.first_delta().and_then(|d| d.content.clone())),
                None => break,
            }
        }

        assert_eq!(
            contents,
            vec![Some("a".to_string()), Some("b".to_string()), None]
        );
    }

    fn tool_chunk(id: Option<&str>, args: Option<&str>) -> ChatChunk {
        let mut call = serde_json::Map::new();
        call.insert("index".into(), json!(0));
        if let Some(id) = id {
            call.insert("id".into(), json!(id));
            call.insert("function".into(), json!({"name": "search", "arguments": args.unwrap_or("")}));
        } else {
            call.insert("function".into(), json!({"arguments": args.unwrap_or("")}));
        }

        serde_json::from_value(json!({
            "id": "r1", "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [call]}}]
        }))
        .unwrap()
    }

    /// Records hook order for tool-call streams; emits nothing.
    struct ToolOrderPolicy {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Policy for ToolOrderPolicy {
        fn name(&self) -> &'static str {
            "tool_order"
        }

        async fn on_chunk_received(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("chunk_received");
            Ok(())
        }

        async fn on_tool_call_delta(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("tool_call_delta");
            Ok(())
        }

        async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("tool_call_complete");

            // The aggregated block must be fully assembled by now.
            let block = ctx.state.just_completed.as_ref().and_then(|b| b.as_tool_call()).unwrap();
            assert_eq!(block.id, "call_1");
            assert_eq!(block.arguments, "{\"q\":\"t\"}");
            Ok(())
        }

        async fn on_finish_reason(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("finish_reason");
            Ok(())
        }
    }

    #[tokio::test]
    async fn tool_call_hooks_fire_in_order_with_aggregated_block() {
        let mut h = harness();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let policy = Arc::new(ToolOrderPolicy { calls: Arc::clone(&calls) });

        let input = futures::stream::iter(vec![
            Ok(tool_chunk(Some("call_1"), Some(""))),
            Ok(tool_chunk(None, Some("{\"q\":\"t\"}"))),
            Ok(finish_chunk()),
        ]);
        let monitor = TimeoutMonitor::new(None);

        run(
            policy,
            &mut h.ctx,
            &mut h.egress,
            Box::pin(input),
            &h.output_tx,
            &h.recorder,
            &monitor,
        )
        .await
        .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "chunk_received",
                "tool_call_delta",
                "chunk_received",
                "tool_call_delta",
                "chunk_received",
                "tool_call_complete",
                "finish_reason",
            ]
        );
    }

    /// Pushes several chunks from a single hook.
    struct BurstPolicy;

    #[async_trait]
    impl Policy for BurstPolicy {
        fn name(&self) -> &'static str {
            "burst"
        }

        async fn on_finish_reason(&self, ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            for text in ["one", "two", "three"] {
                ctx.send_text(text)?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn egress_release_order_is_delivery_order() {
        let mut h = harness();
        let policy = Arc::new(BurstPolicy);

        let input = futures::stream::iter(vec![Ok(finish_chunk())]);
        let monitor = TimeoutMonitor::new(None);

        run(
            policy,
            &mut h.ctx,
            &mut h.egress,
            Box::pin(input),
            &h.output_tx,
            &h.recorder,
            &monitor,
        )
        .await
        .unwrap();

        let mut texts = Vec::new();
        while let Some(Some(chunk)) = h.output_rx.recv().await {
            texts.extend(chunk.first_delta().and_then(|d| d.content.clone()));
        }

        assert_eq!(texts, vec!["one".to_string(), "two".to_string(), "three".to_string()]);
    }

    /// Stalls forever without calling keepalive.
    struct StallingPolicy;

    #[async_trait]
    impl Policy for StallingPolicy {
        fn name(&self) -> &'static str {
            "stalling"
        }

        async fn on_chunk_received(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_monitor_wins_the_race_and_cleanup_runs() {
        let mut h = harness();
        let policy = Arc::new(StallingPolicy);

        let input = futures::stream::iter(vec![Ok(content_chunk("x"))]);
        let monitor = TimeoutMonitor::new(Some(Duration::from_millis(50)));

        let error = run(
            policy,
            &mut h.ctx,
            &mut h.egress,
            Box::pin(input),
            &h.output_tx,
            &h.recorder,
            &monitor,
        )
        .await
        .unwrap_err();

        assert!(matches!(error, ProxyError::PolicyTimeout { .. }), "{error}");

        // Sentinel still arrives after the timeout path.
        assert!(matches!(h.output_rx.recv().await, Some(None)));
    }

    /// Fails on the first chunk.
    struct FailingPolicy;

    #[async_trait]
    impl Policy for FailingPolicy {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn on_chunk_received(&self, _ctx: &mut StreamingPolicyContext) -> ProxyResult<()> {
            Err(ProxyError::PolicyFailure("hook exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn hook_errors_propagate_and_sentinel_still_lands() {
        let mut h = harness();
        let policy = Arc::new(FailingPolicy);

        let input = futures::stream::iter(vec![Ok(content_chunk("x"))]);
        let monitor = TimeoutMonitor::new(None);

        let error = run(
            policy,
            &mut h.ctx,
            &mut h.egress,
            Box::pin(input),
            &h.output_tx,
            &h.recorder,
            &monitor,
        )
        .await
        .unwrap_err();

        assert!(matches!(error, ProxyError::PolicyFailure(_)), "{error}");
        assert!(matches!(h.output_rx.recv().await, Some(None)));
    }
}
