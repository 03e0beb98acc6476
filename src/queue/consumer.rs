//! Consumer Worker Pool
//!
//! Spawns background workers that continuously poll the `MessageQueue` for messages
//! matching one topic pattern. Every worker of a pool competes for the same messages.
//!
//! ## Responsibilities
//! - **Polling**: checking for available messages on the subscribed topics.
//! - **Lease Management**: renewing the claim while a slow handler runs.
//! - **Acknowledgement**: acking on success, releasing for redelivery on error.

use super::queue::MessageQueue;
use super::types::*;

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Type alias for a thread-safe, asynchronous message handler.
pub type MessageHandlerFn =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

const IDLE_POLL: Duration = Duration::from_millis(100);
const CONTENDED_POLL: Duration = Duration::from_millis(50);

pub struct QueueConsumer {
    name: String,
    queue: Arc<MessageQueue>,
    pattern: TopicPattern,
    handler: MessageHandlerFn,
    worker_count: usize,
}

impl QueueConsumer {
    pub fn new<F, Fut>(
        name: &str,
        queue: Arc<MessageQueue>,
        pattern: TopicPattern,
        worker_count: usize,
        handler: F,
    ) -> Arc<Self>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: MessageHandlerFn = Arc::new(move |envelope: Envelope| {
            Box::pin(handler(envelope)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });

        Arc::new(Self {
            name: name.to_string(),
            queue,
            pattern,
            handler,
            worker_count: worker_count.max(1),
        })
    }

    /// Spawns the workers and returns their handles immediately.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting {} workers for consumer '{}' on {}",
            self.worker_count,
            self.name,
            self.pattern.as_str()
        );

        (0..self.worker_count)
            .map(|worker_id| {
                let consumer = self.clone();
                tokio::spawn(async move {
                    consumer.worker_loop(worker_id).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize) {
        tracing::debug!("Worker {}#{} started", self.name, worker_id);

        loop {
            // Visible messages on our topics, oldest first
            let messages = self.queue.available(&self.pattern);

            if messages.is_empty() {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }

            // Every candidate was taken by a sibling worker
            if !self.claim_and_process(messages).await {
                tokio::time::sleep(CONTENDED_POLL).await;
            }
        }
    }

    /// Claims and processes at most one available message. Returns whether one was processed.
    pub async fn poll_once(&self) -> bool {
        let messages = self.queue.available(&self.pattern);
        self.claim_and_process(messages).await
    }

    /// Processes messages until none are available. Returns how many were processed.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while self.poll_once().await {
            processed += 1;
        }
        processed
    }

    async fn claim_and_process(&self, messages: Vec<(MessageId, Envelope)>) -> bool {
        for (message_id, envelope) in messages {
            // Atomic claim: Pending -> InFlight with a fresh lease
            match self.queue.try_claim(&message_id) {
                Ok(true) => {
                    tracing::trace!(
                        "Consumer '{}' claimed message {} on {}",
                        self.name,
                        message_id.0,
                        envelope.topic
                    );
                    self.process_with_lease(&message_id, envelope).await;
                    return true;
                }
                // Lost the race
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("Failed to claim message {}: {}", message_id.0, e);
                    continue;
                }
            }
        }
        false
    }

    /// Runs the handler while a sidecar task keeps the lease alive.
    async fn process_with_lease(&self, message_id: &MessageId, envelope: Envelope) {
        // Start lease renewal
        let renewal_handle = self.spawn_lease_renewal(message_id);

        // Run the handler
        let topic = envelope.topic.clone();
        let result = (self.handler)(envelope).await;

        // Stop lease renewal
        renewal_handle.abort();

        // Settle: ack, or release for redelivery (dead-letters past the cap)
        let settled = match result {
            Ok(()) => self.queue.ack(message_id),
            Err(e) => {
                tracing::error!(
                    "Consumer '{}' failed to handle message {} on {}: {:#}",
                    self.name,
                    message_id.0,
                    topic,
                    e
                );
                self.queue.release(message_id, &e.to_string())
            }
        };

        if let Err(e) = settled {
            tracing::error!("Failed to settle message {}: {}", message_id.0, e);
        }
    }

    fn spawn_lease_renewal(&self, message_id: &MessageId) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let message_id = message_id.clone();
        let every = (queue.lease_duration() / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;

                // Fails once the message was settled or its lease already lapsed
                if queue.renew_lease(&message_id).is_err() {
                    tracing::trace!("Message {} no longer needs lease renewal", message_id.0);
                    break;
                }
            }
        })
    }
}
