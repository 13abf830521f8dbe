//! Event fan-out: durable rows plus pub/sub messages, in emission order.

use std::sync::{Arc, Mutex, PoisonError};

use crate::bus::EventBus;
use crate::events::ConversationEvent;
use crate::persistence::Database;
use crate::queue::SequentialTaskQueue;

/// Fan-out sink for conversation events.
///
/// `record` enqueues the event on the sequential task queue; the worker
/// persists the row and publishes to the bus in one step, so the store and
/// the channels observe identical ordering. Every sink operation is
/// infallible from the caller's point of view: storage and bus failures are
/// logged and swallowed.
#[derive(Clone)]
pub struct EventSink {
    db: Option<Database>,
    bus: Option<EventBus>,
    queue: SequentialTaskQueue,
    capture: Option<Arc<Mutex<Vec<ConversationEvent>>>>,
}

impl EventSink {
    /// Sink writing to the given store and bus. Either may be absent.
    pub fn new(db: Option<Database>, bus: Option<EventBus>) -> Self {
        Self {
            db,
            bus,
            queue: SequentialTaskQueue::new("conversation_events"),
            capture: None,
        }
    }

    /// Sink that records nothing anywhere.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Sink that keeps events in memory, for tests.
    pub fn in_memory() -> (Self, Arc<Mutex<Vec<ConversationEvent>>>) {
        let capture: Arc<Mutex<Vec<ConversationEvent>>> = Arc::default();

        let sink = Self {
            db: None,
            bus: None,
            queue: SequentialTaskQueue::new("conversation_events"),
            capture: Some(Arc::clone(&capture)),
        };

        (sink, capture)
    }

    /// Open the call row for a new transaction.
    pub fn begin_call(&self, call_id: &str, model: &str) {
        let Some(db) = self.db.clone() else { return };
        let call_id = call_id.to_string();
        let model = model.to_string();

        self.queue.submit(async move { db.ensure_call(&call_id, Some(&model)).await });
    }

    /// Mark the call row finished.
    pub fn finish_call(&self, call_id: &str, status: &str) {
        let Some(db) = self.db.clone() else { return };
        let call_id = call_id.to_string();
        let status = status.to_string();

        self.queue.submit(async move { db.complete_call(&call_id, &status).await });
    }

    /// Record one event: durable row plus per-call and global publication.
    pub fn record(&self, event: ConversationEvent) {
        if let Some(capture) = &self.capture {
            capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        }

        let db = self.db.clone();
        let bus = self.bus.clone();

        if db.is_none() && bus.is_none() {
            return;
        }

        self.queue.submit(async move {
            if let Some(db) = db
                && let Err(error) = db.insert_event(&event).await
            {
                log::error!("failed to persist event {} for {}: {error:#}", event.event_type, event.call_id);
            }

            if let Some(bus) = bus
                && let Err(error) = bus.publish_event(&event).await
            {
                log::error!("failed to publish event {} for {}: {error:#}", event.event_type, event.call_id);
            }

            Ok(())
        });
    }

    /// Yield until all previously recorded events have drained.
    pub async fn settled(&self) {
        self.queue.settled().await;
    }
}
