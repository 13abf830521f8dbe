//! Execution contexts handed to policy hooks.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{ProxyError, ProxyResult};
use crate::messages::openai::{ChatChunk, ChatRequest, FinishReason, build_finish_chunk, build_text_chunk};
use crate::observability::context::ObservabilityContext;
use crate::streaming::assembler::StreamState;
use crate::streaming::timeout::KeepaliveHandle;

/// Free-form per-transaction key-value map owned by the policy for the
/// duration of one request. Never shared across transactions.
pub type Scratchpad = serde_json::Map<String, Value>;

/// Context for request and non-streaming response hooks.
pub struct PolicyContext {
    obs: Arc<ObservabilityContext>,
    /// Read-only view of the current request.
    pub request: Arc<ChatRequest>,
    /// The policy's private workspace for this transaction.
    pub scratchpad: Scratchpad,
}

impl PolicyContext {
    pub fn new(obs: Arc<ObservabilityContext>, request: Arc<ChatRequest>) -> Self {
        Self {
            obs,
            request,
            scratchpad: Scratchpad::new(),
        }
    }

    pub fn call_id(&self) -> &str {
        self.obs.call_id()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.obs.session_id()
    }

    /// Record a policy event on both persistence paths.
    pub fn record_event(&self, event_type: &str, payload: Value) {
        self.obs.record_event(event_type, payload);
    }
}

/// Context for streaming hooks.
///
/// Adds the live stream-state view, the egress queue the policy writes
/// into, and the keepalive callback for long-running hook work.
pub struct StreamingPolicyContext {
    /// The request-level context, scratchpad included.
    pub policy_ctx: PolicyContext,
    /// Live view of the original streaming response.
    pub state: StreamState,
    egress: mpsc::UnboundedSender<ChatChunk>,
    keepalive: KeepaliveHandle,
}

impl StreamingPolicyContext {
    pub(crate) fn new(
        policy_ctx: PolicyContext,
        egress: mpsc::UnboundedSender<ChatChunk>,
        keepalive: KeepaliveHandle,
    ) -> Self {
        Self {
            policy_ctx,
            state: StreamState::new(),
            egress,
            keepalive,
        }
    }

    /// Release a chunk toward the client.
    ///
    /// The egress queue is written only here and drained by the dispatcher
    /// after every hook set, so release order is delivery order.
    pub fn send(&self, chunk: ChatChunk) -> ProxyResult<()> {
        self.egress.send(chunk).map_err(|_| ProxyError::StreamClosed)
    }

    /// Release a plain text chunk stamped with the stream's id and model.
    pub fn send_text(&self, text: impl Into<String>) -> ProxyResult<()> {
        self.send(build_text_chunk(
            self.state.response_id(),
            self.stream_model(),
            text,
            None,
        ))
    }

    /// Release a finish chunk stamped with the stream's id and model.
    pub fn send_finish(&self, reason: FinishReason) -> ProxyResult<()> {
        let usage = self.state.chunks.iter().rev().find_map(|chunk| chunk.usage);
        self.send(build_finish_chunk(
            self.state.response_id(),
            self.stream_model(),
            reason,
            usage,
        ))
    }

    /// Signal that a long-running hook is still making progress, resetting
    /// the policy timeout.
    pub fn keepalive(&self) {
        self.keepalive.keepalive();
    }

    /// Record a policy event on both persistence paths.
    pub fn record_event(&self, event_type: &str, payload: Value) {
        self.policy_ctx.record_event(event_type, payload);
    }

    /// The transaction id.
    pub fn call_id(&self) -> &str {
        self.policy_ctx.call_id()
    }

    /// Model for synthesized chunks: from the stream when it announced one,
    /// otherwise from the request.
    fn stream_model(&self) -> String {
        let model = self.state.model();
        if model.is_empty() {
            self.policy_ctx.request.model.clone()
        } else {
            model.to_string()
        }
    }
}
