//! Queue Module Tests
//!
//! ## Test Scopes
//! - **Routing**: Topic pattern matching.
//! - **Delivery**: Claim races, delayed visibility, lease expiry and redelivery.
//! - **Consumers**: Handler execution, ack on success, release and dead-lettering on error.

#[cfg(test)]
mod tests {
    use crate::queue::consumer::QueueConsumer;
    use crate::queue::queue::MessageQueue;
    use crate::queue::types::{DeliveryStatus, Envelope, TopicPattern};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    fn only_message(queue: &MessageQueue, topic: &str) -> Envelope {
        let mut messages = queue.messages_on(&TopicPattern::new(topic));
        assert_eq!(messages.len(), 1);
        messages.remove(0)
    }

    // ============================================================
    // TEST 1: Topic patterns
    // ============================================================

    #[test]
    fn test_topic_pattern_matching() {
        let exact = TopicPattern::new("aggregation.completed");
        assert!(exact.matches("aggregation.completed"));
        assert!(!exact.matches("aggregation.completed.extra"));

        let wildcard = TopicPattern::new("integration.result.*");
        assert!(wildcard.matches("integration.result.aave"));
        assert!(wildcard.matches("integration.result.uniswap-v3"));
        assert!(!wildcard.matches("integration.result."));
        assert!(!wildcard.matches("integration.request.aave"));
    }

    // ============================================================
    // TEST 2: Claiming
    // ============================================================

    #[test]
    fn test_message_can_only_be_claimed_once() {
        let queue = MessageQueue::default();
        let id = queue.publish("jobs.a", &Ping { n: 1 }).unwrap();

        assert!(queue.try_claim(&id).unwrap());
        assert!(!queue.try_claim(&id).unwrap());

        let pattern = TopicPattern::new("jobs.*");
        assert!(queue.available(&pattern).is_empty());
    }

    #[test]
    fn test_delayed_message_is_invisible_until_due() {
        let queue = MessageQueue::default();
        let pattern = TopicPattern::new("jobs.*");

        queue
            .publish_delayed("jobs.a", &Ping { n: 1 }, Duration::from_secs(60))
            .unwrap();
        queue.publish("jobs.b", &Ping { n: 2 }).unwrap();

        let available = queue.available(&pattern);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].1.decode::<Ping>().unwrap(), Ping { n: 2 });
    }

    #[tokio::test]
    async fn test_expired_lease_allows_redelivery() {
        let queue = MessageQueue::new(Duration::from_millis(10), 5);
        let pattern = TopicPattern::new("jobs.*");
        let id = queue.publish("jobs.a", &Ping { n: 1 }).unwrap();

        assert!(queue.try_claim(&id).unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let available = queue.available(&pattern);
        assert_eq!(available.len(), 1);
        assert!(queue.try_claim(&id).unwrap());
        assert_eq!(only_message(&queue, "jobs.a").delivery_count, 2);
    }

    #[test]
    fn test_release_then_dead_letter_after_max_deliveries() {
        let queue = MessageQueue::new(Duration::from_secs(30), 2);
        let id = queue.publish("jobs.a", &Ping { n: 1 }).unwrap();

        assert!(queue.try_claim(&id).unwrap());
        queue.release(&id, "boom").unwrap();
        assert_eq!(only_message(&queue, "jobs.a").status, DeliveryStatus::Pending);

        assert!(queue.try_claim(&id).unwrap());
        queue.release(&id, "boom again").unwrap();

        assert_eq!(
            only_message(&queue, "jobs.a").status,
            DeliveryStatus::DeadLettered {
                error: "boom again".to_string()
            }
        );
        assert_eq!(queue.stats().dead_lettered, 1);
    }

    #[test]
    fn test_purge_finished_keeps_live_messages() {
        let queue = MessageQueue::default();
        let done = queue.publish("jobs.a", &Ping { n: 1 }).unwrap();
        queue.publish("jobs.b", &Ping { n: 2 }).unwrap();

        queue.try_claim(&done).unwrap();
        queue.ack(&done).unwrap();

        assert_eq!(queue.purge_finished(Duration::ZERO), 1);
        assert_eq!(queue.stats().pending, 1);
        assert_eq!(queue.stats().acked, 0);
    }

    // ============================================================
    // TEST 3: Consumers
    // ============================================================

    #[tokio::test]
    async fn test_consumer_drains_and_acks() {
        let queue = Arc::new(MessageQueue::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let consumer = QueueConsumer::new(
            "test",
            queue.clone(),
            TopicPattern::new("jobs.*"),
            1,
            move |envelope| {
                let seen = seen_clone.clone();
                async move {
                    let ping: Ping = envelope.decode()?;
                    seen.fetch_add(ping.n as usize, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        queue.publish("jobs.a", &Ping { n: 1 }).unwrap();
        queue.publish("jobs.b", &Ping { n: 2 }).unwrap();
        queue.publish("other.c", &Ping { n: 100 }).unwrap();

        let processed = consumer.drain().await;

        assert_eq!(processed, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().acked, 2);
        assert_eq!(queue.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_failing_handler_releases_message() {
        let queue = Arc::new(MessageQueue::new(Duration::from_secs(30), 3));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let consumer = QueueConsumer::new(
            "failing",
            queue.clone(),
            TopicPattern::new("jobs.a"),
            1,
            move |_envelope| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("Intentional error"))
                }
            },
        );

        queue.publish("jobs.a", &Ping { n: 1 }).unwrap();

        let processed = consumer.drain().await;

        assert_eq!(processed, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let envelope = only_message(&queue, "jobs.a");
        assert!(matches!(envelope.status, DeliveryStatus::DeadLettered { .. }));
        assert_eq!(envelope.last_error.as_deref(), Some("Intentional error"));
    }

    #[tokio::test]
    async fn test_competing_workers_process_each_message_once() {
        let queue = Arc::new(MessageQueue::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        for n in 0..50 {
            queue.publish("jobs.a", &Ping { n }).unwrap();
        }

        let consumer = QueueConsumer::new(
            "pool",
            queue.clone(),
            TopicPattern::new("jobs.*"),
            4,
            move |_envelope| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let handles = consumer.start();

        for _ in 0..100 {
            if queue.stats().acked == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for handle in handles {
            handle.abort();
        }

        assert_eq!(queue.stats().acked, 50);
        assert_eq!(seen.load(Ordering::SeqCst), 50);
    }
}
