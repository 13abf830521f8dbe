//! The normalized conversation event record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Well-known event type identifiers emitted by the pipeline.
pub mod event_types {
    /// The request as received from the client, before any policy ran.
    pub const CLIENT_REQUEST: &str = "pipeline.client_request";
    /// The request as forwarded to the backend, after `on_request`.
    pub const BACKEND_REQUEST: &str = "pipeline.backend_request";
    /// The response as delivered to the client.
    pub const CLIENT_RESPONSE: &str = "pipeline.client_response";
    /// Original and final request snapshots for one transaction.
    pub const REQUEST_RECORDED: &str = "transaction.request_recorded";
    /// Reconstructed ingress/egress responses at the end of a stream.
    pub const STREAMING_RESPONSE_RECORDED: &str = "transaction.streaming_response_recorded";
    /// Original and final responses for a non-streaming transaction.
    pub const NON_STREAMING_RESPONSE_RECORDED: &str = "transaction.non_streaming_response_recorded";
    /// Emitted once per direction when a chunk buffer overflows its cap.
    pub const CHUNKS_TRUNCATED: &str = "transaction.chunks_truncated";
    /// A recoverable anomaly worth surfacing in the event stream.
    pub const WARNING: &str = "pipeline.warning";
}

/// A timestamped, JSON-serializable record tied to one call id.
///
/// Events are the unit of observability: they are persisted as rows in
/// `conversation_events` and published on the per-call and global pub/sub
/// channels in the order they were emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    /// Transaction this event belongs to.
    pub call_id: String,
    /// Event type identifier, e.g. `pipeline.client_request`.
    pub event_type: String,
    /// When the event was emitted.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Event-specific data.
    pub payload: serde_json::Value,
}

impl ConversationEvent {
    /// Create an event stamped with the current time.
    pub fn new(call_id: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            event_type: event_type.into(),
            timestamp: OffsetDateTime::now_utc(),
            payload,
        }
    }
}
