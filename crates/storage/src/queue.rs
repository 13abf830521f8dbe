//! Single-worker FIFO scheduler for storage I/O.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

type Task = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

struct Inner {
    queue: VecDeque<Task>,
    worker_running: bool,
}

/// Process submitted futures one-by-one in submission order.
///
/// A thread pool would reorder per-call events; a single cooperative worker
/// cannot. The worker task exits when the queue drains and the next
/// submission starts a new one, so an idle process keeps no task alive.
/// A failed task is logged and the next one runs.
#[derive(Clone)]
pub struct SequentialTaskQueue {
    name: &'static str,
    inner: Arc<Mutex<Inner>>,
}

impl SequentialTaskQueue {
    /// Create an empty queue bound to `name` for logging.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                worker_running: false,
            })),
        }
    }

    /// Schedule `task` to run after previously queued tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let spawn_worker = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.queue.push_back(Box::pin(task));

            if inner.worker_running {
                false
            } else {
                inner.worker_running = true;
                true
            }
        };

        if spawn_worker {
            let inner = Arc::clone(&self.inner);
            let name = self.name;
            tokio::spawn(drain(inner, name));
        }
    }

    /// True when no task is queued and no worker is running.
    ///
    /// Tests use this to wait for submitted work to settle.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.queue.is_empty() && !inner.worker_running
    }

    /// Yield until every previously submitted task has completed.
    pub async fn settled(&self) {
        while !self.is_idle() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

async fn drain(inner: Arc<Mutex<Inner>>, name: &'static str) {
    loop {
        let task = {
            let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.queue.pop_front() {
                Some(task) => task,
                None => {
                    guard.worker_running = false;
                    return;
                }
            }
        };

        if let Err(error) = task.await {
            log::error!("SequentialTaskQueue[{name}] task failed: {error:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::SequentialTaskQueue;

    #[tokio::test]
    async fn runs_tasks_in_submission_order() {
        let queue = SequentialTaskQueue::new("test");
        let seen: Arc<Mutex<Vec<u32>>> = Arc::default();

        for i in 0..16 {
            let seen = Arc::clone(&seen);
            queue.submit(async move {
                // Later tasks sleep less; order must still hold.
                tokio::time::sleep(std::time::Duration::from_millis(16 - i as u64)).await;
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }

        queue.settled().await;
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_task_does_not_stall_the_queue() {
        let queue = SequentialTaskQueue::new("test");
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        queue.submit(async { Err(anyhow::anyhow!("boom")) });

        let seen_clone = Arc::clone(&seen);
        queue.submit(async move {
            seen_clone.lock().unwrap().push("after-failure");
            Ok(())
        });

        queue.settled().await;
        assert_eq!(*seen.lock().unwrap(), vec!["after-failure"]);
    }

    #[tokio::test]
    async fn worker_restarts_after_going_idle() {
        let queue = SequentialTaskQueue::new("test");
        let seen: Arc<Mutex<Vec<u32>>> = Arc::default();

        let seen_clone = Arc::clone(&seen);
        queue.submit(async move {
            seen_clone.lock().unwrap().push(1);
            Ok(())
        });
        queue.settled().await;

        let seen_clone = Arc::clone(&seen);
        queue.submit(async move {
            seen_clone.lock().unwrap().push(2);
            Ok(())
        });
        queue.settled().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
