//! The observability context owned by one transaction.

use fastrace::Span;
use fastrace::collector::SpanContext;
use storage::{ConversationEvent, EventSink};

/// Carries the tracing span context, the event sink, and the session id for
/// one transaction. Blocks and buffers reference the transaction through its
/// call id, never through pointers back into this structure.
pub struct ObservabilityContext {
    call_id: String,
    session_id: Option<String>,
    span_context: SpanContext,
    sink: EventSink,
}

impl ObservabilityContext {
    /// Open the context for a fresh transaction, rooting its trace.
    pub fn new(call_id: impl Into<String>, session_id: Option<String>, sink: EventSink) -> Self {
        Self {
            call_id: call_id.into(),
            session_id,
            span_context: SpanContext::random(),
            sink,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// A span parented on this transaction's trace.
    pub fn span(&self, name: &'static str) -> Span {
        Span::root(name, self.span_context)
    }

    /// Record an event on both persistence paths, in emission order.
    /// Infallible by design; storage trouble never reaches the request path.
    pub fn record_event(&self, event_type: &str, payload: serde_json::Value) {
        self.sink
            .record(ConversationEvent::new(self.call_id.clone(), event_type, payload));
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }
}
