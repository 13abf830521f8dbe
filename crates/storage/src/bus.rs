//! Redis pub/sub bus: per-call channels, the global activity channel, SSE
//! subscription streams, and the distributed policy-swap lock.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::events::ConversationEvent;

const GLOBAL_ACTIVITY_CHANNEL: &str = "luthien:activity:global";
const POLICY_LOCK_KEY: &str = "luthien:policy:lock";

/// Reconnect backoff bounds for subscriber streams.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Pub/sub channel carrying every event for one call.
pub fn conversation_channel(call_id: &str) -> String {
    format!("luthien:conversation:{call_id}")
}

/// Pub/sub channel receiving all events regardless of call.
pub fn global_activity_channel() -> &'static str {
    GLOBAL_ACTIVITY_CHANNEL
}

/// Key of the distributed policy hot-swap lock.
pub fn policy_lock_key() -> &'static str {
    POLICY_LOCK_KEY
}

/// Pub/sub bus handle. Cloning shares the underlying connection manager.
#[derive(Clone)]
pub struct EventBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl EventBus {
    /// Connect to the bus and establish a managed connection.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;

        Ok(Self { client, manager })
    }

    /// Publish an event to its per-call channel and the global channel.
    ///
    /// Publishing is fire-and-forget: slow subscribers drop messages rather
    /// than queue them, so this never blocks on a consumer.
    pub async fn publish_event(&self, event: &ConversationEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.manager.clone();

        conn.publish::<_, _, ()>(conversation_channel(&event.call_id), &payload)
            .await?;
        conn.publish::<_, _, ()>(GLOBAL_ACTIVITY_CHANNEL, &payload).await?;

        Ok(())
    }

    /// SSE frames for one pub/sub channel.
    ///
    /// The stream never ends on its own: bus failures are retried with
    /// exponential backoff and `: ping` heartbeat comments are interleaved
    /// every `heartbeat` so disconnected clients are detected by the
    /// transport. Dropping the stream unsubscribes.
    pub fn sse_frames(&self, channel: String, heartbeat: Duration) -> impl Stream<Item = String> + Send + 'static {
        let state = SubscriberState {
            client: self.client.clone(),
            channel,
            heartbeat,
            backoff: INITIAL_BACKOFF,
            messages: None,
        };

        futures::stream::unfold(state, |mut state| async move {
            let frame = state.next_frame().await;
            Some((frame, state))
        })
    }

    /// Try to acquire the policy hot-swap lock.
    ///
    /// Returns `None` when another instance holds it. The lock expires on
    /// its own after `ttl` in case the holder dies without releasing.
    pub async fn acquire_policy_lock(&self, ttl: Duration) -> anyhow::Result<Option<PolicyLockGuard>> {
        let token = uuid::Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(POLICY_LOCK_KEY)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| PolicyLockGuard {
            manager: self.manager.clone(),
            token,
        }))
    }
}

/// Holder of the distributed policy lock. Release is explicit so failures
/// can be surfaced; an unreleased guard expires with the lock TTL.
pub struct PolicyLockGuard {
    manager: ConnectionManager,
    token: String,
}

impl PolicyLockGuard {
    /// Release the lock if this guard still owns it.
    pub async fn release(self) -> anyhow::Result<()> {
        // Compare-and-delete so an expired lock grabbed by another instance
        // is never deleted from under it.
        let script = redis::Script::new(
            r#"
            if redis.call('get', KEYS[1]) == ARGV[1] then
                return redis.call('del', KEYS[1])
            else
                return 0
            end
            "#,
        );

        let mut conn = self.manager.clone();
        script
            .key(POLICY_LOCK_KEY)
            .arg(&self.token)
            .invoke_async::<i64>(&mut conn)
            .await?;

        Ok(())
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = redis::Msg> + Send + Sync>>;

struct SubscriberState {
    client: redis::Client,
    channel: String,
    heartbeat: Duration,
    backoff: Duration,
    messages: Option<MessageStream>,
}

impl SubscriberState {
    async fn next_frame(&mut self) -> String {
        loop {
            if self.messages.is_none() {
                match self.subscribe().await {
                    Ok(stream) => {
                        self.messages = Some(stream);
                        self.backoff = INITIAL_BACKOFF;
                    }
                    Err(error) => {
                        log::error!(
                            "bus subscription to {} failed: {error}; retrying in {:?}",
                            self.channel,
                            self.backoff
                        );
                        tokio::time::sleep(self.backoff).await;
                        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                }
            }

            let messages = self.messages.as_mut().expect("subscribed above");

            match tokio::time::timeout(self.heartbeat, messages.next()).await {
                Ok(Some(message)) => match message.get_payload::<String>() {
                    Ok(payload) => return format!("data: {payload}\n\n"),
                    Err(error) => {
                        log::warn!("dropping undecodable bus message on {}: {error}", self.channel);
                        continue;
                    }
                },
                // Connection lost; resubscribe with backoff.
                Ok(None) => {
                    self.messages = None;
                    continue;
                }
                // Quiet interval: emit a heartbeat comment.
                Err(_) => return ": ping\n\n".to_string(),
            }
        }
    }

    async fn subscribe(&self) -> anyhow::Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        Ok(Box::pin(pubsub.into_on_message()))
    }
}
