//! The policy orchestrator: applies a policy to each phase of one
//! transaction and launches the streaming dispatcher.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use storage::event_types;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ProxyResult;
use crate::messages::openai::{ChatChunk, ChatRequest, ChatResponse};
use crate::observability::recorder::TransactionRecorder;
use crate::policy::Policy;
use crate::policy::context::{PolicyContext, StreamingPolicyContext};
use crate::streaming::ChunkStream;
use crate::streaming::dispatcher;
use crate::streaming::timeout::TimeoutMonitor;

/// Capacity of the dispatcher → client output queue. Small on purpose:
/// backpressure from a slow client should reach the policy quickly instead
/// of ballooning memory.
const OUTPUT_QUEUE_CAPACITY: usize = 64;

/// The running dispatcher for one streaming transaction.
pub(crate) struct StreamHandles {
    /// Policy-released chunks; `None` is the end-of-stream sentinel.
    pub output: mpsc::Receiver<Option<ChatChunk>>,
    /// The dispatcher task; its result carries hook errors and timeouts.
    pub task: JoinHandle<ProxyResult<()>>,
}

/// Applies one policy snapshot to the phases of one transaction.
pub(crate) struct PolicyOrchestrator {
    policy: Arc<dyn Policy>,
    policy_timeout: Option<Duration>,
}

impl PolicyOrchestrator {
    pub fn new(policy: Arc<dyn Policy>, stream_config: &config::StreamConfig) -> Self {
        Self {
            policy,
            policy_timeout: stream_config.policy_timeout_seconds.map(Duration::from_secs_f64),
        }
    }

    /// Run `on_request`, record the request summary, and emit the
    /// backend-request marker.
    pub async fn process_request(&self, original: ChatRequest, ctx: &mut PolicyContext) -> ProxyResult<ChatRequest> {
        let final_request = self.policy.on_request(original.clone(), ctx).await?;

        ctx.record_event(
            event_types::REQUEST_RECORDED,
            json!({
                "original": original,
                "final": final_request,
                "policy": self.policy.name(),
            }),
        );
        ctx.record_event(event_types::BACKEND_REQUEST, json!({"request": final_request}));

        ctx.request = Arc::new(final_request.clone());
        Ok(final_request)
    }

    /// Run `on_response` over a complete response and record both versions.
    pub async fn process_full_response(
        &self,
        original: ChatResponse,
        ctx: &mut PolicyContext,
        recorder: &TransactionRecorder,
    ) -> ProxyResult<ChatResponse> {
        let final_response = self.policy.on_response(original.clone(), ctx).await?;
        recorder.record_non_streaming(&original, &final_response);
        Ok(final_response)
    }

    /// Launch the dispatcher over an upstream stream.
    ///
    /// The policy context (scratchpad included) moves into the streaming
    /// context, so state seeded by `on_request` is visible to stream hooks.
    pub fn launch_stream(
        &self,
        ctx: PolicyContext,
        upstream: ChunkStream,
        recorder: Arc<TransactionRecorder>,
    ) -> StreamHandles {
        let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);

        let monitor = TimeoutMonitor::new(self.policy_timeout);
        let mut streaming_ctx = StreamingPolicyContext::new(ctx, egress_tx, monitor.handle());
        let policy = Arc::clone(&self.policy);

        let task = tokio::spawn(async move {
            dispatcher::run(
                policy,
                &mut streaming_ctx,
                &mut egress_rx,
                upstream,
                &output_tx,
                &recorder,
                &monitor,
            )
            .await
        });

        StreamHandles {
            output: output_rx,
            task,
        }
    }
}
