//! Bounded worker pool for webhook delivery.
//!
//! Deliveries are enqueued non-blockingly; `W` workers drain the channel
//! concurrently. Shutdown joins every worker explicitly (the source
//! implementation this is modelled on signals completion from a single
//! worker only, which races if that worker finishes before the others --
//! SPEC_FULL.md section 9 calls for the corrected join-barrier behaviour
//! implemented here).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::WebhookClient;
use super::payload::WebhookPayload;

struct Delivery {
    url: String,
    payload: WebhookPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("webhook queue is full")]
    Full,
    #[error("webhook queue is cancelled")]
    Cancelled,
}

/// Configuration for [`WebhookQueue`]. Defaults match SPEC_FULL.md section 4.5.
#[derive(Debug, Clone)]
pub struct WebhookQueueConfig {
    pub workers: usize,
    pub capacity: usize,
}

impl Default for WebhookQueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            capacity: 100,
        }
    }
}

/// A running webhook delivery queue. Call [`WebhookQueue::stop`] to drain
/// and join every worker before dropping.
pub struct WebhookQueue {
    sender: mpsc::Sender<Delivery>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WebhookQueue {
    /// Construct and start the queue's workers immediately.
    pub fn start(client: WebhookClient, config: WebhookQueueConfig, cancel: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let client = Arc::new(client);

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let receiver = Arc::clone(&receiver);
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(id, receiver, client, cancel).await;
            }));
        }

        Self {
            sender,
            workers,
            cancel,
        }
    }

    /// Non-blocking enqueue. Returns [`EnqueueError::Full`] if the channel
    /// has no capacity, [`EnqueueError::Cancelled`] if the queue has been
    /// stopped.
    pub fn enqueue(&self, url: String, payload: WebhookPayload) -> Result<(), EnqueueError> {
        if self.cancel.is_cancelled() {
            return Err(EnqueueError::Cancelled);
        }
        self.sender
            .try_send(Delivery { url, payload })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Cancelled,
            })
    }

    /// Signal every worker to drain its in-flight delivery and stop, then
    /// join all of them. Waits for all workers, not just the first.
    pub async fn stop(self) {
        self.cancel.cancel();
        drop(self.sender);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
    client: Arc<WebhookClient>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(delivery) = delivery else {
            tracing::debug!(worker = id, "webhook queue channel closed, worker exiting");
            return;
        };
        if let Err(e) = client.send(&cancel, &delivery.url, &delivery.payload).await {
            tracing::error!(worker = id, error = %e, "webhook delivery failed permanently");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MainTask, TaskStatus};
    use crate::webhook::client::WebhookClientConfig;
    use crate::webhook::payload::main_task_completed;

    fn payload() -> WebhookPayload {
        let mt = MainTask {
            id: "mt-1".into(),
            title: "Main".into(),
            worktree_path: String::new(),
            branch_name: String::new(),
            repo_path: "/repo".into(),
            status: TaskStatus::Completed,
            created_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
            webhook_url: String::new(),
            sub_tasks: vec![],
            completed_sub_tasks: 0,
            error_message: String::new(),
        };
        main_task_completed(&mt)
    }

    #[tokio::test]
    async fn enqueue_and_stop_joins_all_workers() {
        let client = WebhookClient::new(WebhookClientConfig::default());
        let cancel = CancellationToken::new();
        let queue = WebhookQueue::start(
            client,
            WebhookQueueConfig {
                workers: 2,
                capacity: 10,
            },
            cancel,
        );

        // Empty url means immediate success with no network call.
        queue.enqueue(String::new(), payload()).unwrap();
        queue.enqueue(String::new(), payload()).unwrap();

        queue.stop().await;
    }

    #[tokio::test]
    async fn enqueue_full_surfaces_error() {
        let client = WebhookClient::new(WebhookClientConfig::default());
        let cancel = CancellationToken::new();
        // Zero workers: nothing drains the channel, so it fills up.
        let queue = WebhookQueue::start(
            client,
            WebhookQueueConfig {
                workers: 0,
                capacity: 1,
            },
            cancel,
        );

        queue.enqueue(String::new(), payload()).unwrap();
        let result = queue.enqueue(String::new(), payload());
        assert!(matches!(result, Err(EnqueueError::Full)));

        queue.stop().await;
    }
}
