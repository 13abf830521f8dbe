//! Durable store, pub/sub bus, and event fan-out for the Luthien control plane.
//!
//! Two sinks exist for every recorded event: append-only rows in PostgreSQL
//! and fire-and-forget messages on Redis pub/sub channels. Both are fed
//! through a sequential task queue so per-call ordering is preserved and the
//! hot request path never waits on storage latency. Storage failures are
//! logged and swallowed; they never surface to clients.

mod bus;
mod events;
mod persistence;
mod queue;
mod sink;

pub use bus::{EventBus, PolicyLockGuard, global_activity_channel, conversation_channel, policy_lock_key};
pub use events::{ConversationEvent, event_types};
pub use persistence::{Database, PolicyConfigRow, RequestLogRecord};
pub use queue::SequentialTaskQueue;
pub use sink::EventSink;
