//! Keepalive-driven timeout monitor for the policy dispatcher.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Resets the monitor deadline. Handed to policies through the streaming
/// context so long-running hook work can signal progress.
#[derive(Clone)]
pub struct KeepaliveHandle {
    last_activity: Arc<Mutex<Instant>>,
}

impl KeepaliveHandle {
    /// Signal that processing is making progress, resetting the deadline.
    pub fn keepalive(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// Cooperative watchdog raced against the dispatcher.
///
/// [`TimeoutMonitor::expired`] resolves only once more than the configured
/// timeout has passed since the last keepalive. With no timeout configured it
/// never resolves, so the `select!` it participates in always takes the
/// dispatcher branch.
pub struct TimeoutMonitor {
    timeout: Option<Duration>,
    last_activity: Arc<Mutex<Instant>>,
}

impl TimeoutMonitor {
    /// Must be created inside a tokio runtime.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            last_activity: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Handle for resetting the deadline.
    pub fn handle(&self) -> KeepaliveHandle {
        KeepaliveHandle {
            last_activity: Arc::clone(&self.last_activity),
        }
    }

    /// Resolves with the configured timeout in seconds once it has elapsed
    /// without a keepalive.
    pub async fn expired(&self) -> f64 {
        let Some(timeout) = self.timeout else {
            return std::future::pending().await;
        };

        loop {
            let deadline = {
                let last = *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner);
                last + timeout
            };

            if Instant::now() >= deadline {
                return timeout.as_secs_f64();
            }

            tokio::time::sleep_until(deadline).await;
        }
    }
}
