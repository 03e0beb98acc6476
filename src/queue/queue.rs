//! In-Process Message Queue
//!
//! A topic-routed queue with competing consumers. Messages are never pushed to a
//! consumer; workers poll for available messages and "claim" them by taking a lease.
//!
//! ## Responsibilities
//! - **Routing**: Messages carry a topic; consumers select them with a `TopicPattern`.
//! - **Delayed delivery**: A message can be published with a visibility delay (retries).
//! - **Leasing**: A claimed message stays invisible until acked, released, or its lease
//!   runs out. An expired lease makes it claimable again (at-least-once delivery).
//! - **Dead-lettering**: Messages that keep failing are parked after `max_deliveries`.

use super::types::*;
use crate::storage::now_ms;

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

pub struct MessageQueue {
    /// Structure: `Message ID -> Envelope`.
    messages: Arc<DashMap<MessageId, Envelope>>,
    lease_duration: Duration,
    max_deliveries: u32,
}

impl MessageQueue {
    pub fn new(lease_duration: Duration, max_deliveries: u32) -> Self {
        Self {
            messages: Arc::new(DashMap::new()),
            lease_duration,
            max_deliveries: max_deliveries.max(1),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn lease_ms(&self) -> u64 {
        self.lease_duration.as_millis() as u64
    }

    /// Publishes a message that is immediately visible.
    pub fn publish<T: Serialize>(&self, topic: &str, body: &T) -> Result<MessageId> {
        self.publish_delayed(topic, body, Duration::ZERO)
    }

    /// Publishes a message that becomes visible after `delay`.
    pub fn publish_delayed<T: Serialize>(
        &self,
        topic: &str,
        body: &T,
        delay: Duration,
    ) -> Result<MessageId> {
        let body = serde_json::to_value(body)?;
        let message_id = MessageId::new();
        let now = now_ms();

        self.messages.insert(
            message_id.clone(),
            Envelope {
                topic: topic.to_string(),
                body,
                status: DeliveryStatus::Pending,
                delivery_count: 0,
                created_at: now,
                visible_at: now + delay.as_millis() as u64,
                lease_expires: None,
                finished_at: None,
                last_error: None,
            },
        );

        tracing::debug!(
            "Published message {} on {} (delay {:?})",
            message_id.0,
            topic,
            delay
        );

        Ok(message_id)
    }

    /// Messages matching `pattern` that a consumer may claim right now, oldest first.
    ///
    /// Eligible messages are:
    /// 1. `Pending` and visible.
    /// 2. `InFlight` BUT the lease has expired (consumer crashed or hung).
    pub fn available(&self, pattern: &TopicPattern) -> Vec<(MessageId, Envelope)> {
        let now = now_ms();
        let mut messages: Vec<(MessageId, Envelope)> = self
            .messages
            .iter()
            .filter(|entry| pattern.matches(&entry.topic) && entry.is_available(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        messages.sort_by_key(|(_, envelope)| (envelope.visible_at, envelope.created_at));
        messages
    }

    /// Attempts to lock a message for processing.
    ///
    /// Returns `Ok(false)` if another consumer won the race or the message is no longer
    /// available. A message whose lease lapsed too many times is dead-lettered instead.
    pub fn try_claim(&self, message_id: &MessageId) -> Result<bool> {
        let Some(mut entry) = self.messages.get_mut(message_id) else {
            return Ok(false);
        };

        let now = now_ms();
        if !entry.is_available(now) {
            return Ok(false);
        }

        if entry.delivery_count >= self.max_deliveries {
            let error = entry
                .last_error
                .clone()
                .unwrap_or_else(|| "lease expired".to_string());
            tracing::warn!(
                "Dead-lettering message {} on {} after {} deliveries",
                message_id.0,
                entry.topic,
                entry.delivery_count
            );
            entry.status = DeliveryStatus::DeadLettered { error };
            entry.lease_expires = None;
            entry.finished_at = Some(now);
            return Ok(false);
        }

        entry.status = DeliveryStatus::InFlight;
        entry.delivery_count += 1;
        entry.lease_expires = Some(now + self.lease_ms());

        tracing::trace!("Claimed message {}", message_id.0);
        Ok(true)
    }

    /// Extends the lease of an in-flight message.
    pub fn renew_lease(&self, message_id: &MessageId) -> Result<()> {
        let mut entry = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| anyhow::anyhow!("Message not found"))?;

        if entry.status != DeliveryStatus::InFlight {
            return Err(anyhow::anyhow!(
                "Message not in flight (status: {:?})",
                entry.status
            ));
        }

        entry.lease_expires = Some(now_ms() + self.lease_ms());
        Ok(())
    }

    /// Marks a message as processed.
    pub fn ack(&self, message_id: &MessageId) -> Result<()> {
        let mut entry = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| anyhow::anyhow!("Message not found"))?;

        entry.status = DeliveryStatus::Acked;
        entry.lease_expires = None;
        entry.finished_at = Some(now_ms());
        Ok(())
    }

    /// Hands a failed message back for redelivery, or dead-letters it once the
    /// delivery budget is spent.
    pub fn release(&self, message_id: &MessageId, error: &str) -> Result<()> {
        let mut entry = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| anyhow::anyhow!("Message not found"))?;

        entry.lease_expires = None;
        entry.last_error = Some(error.to_string());

        if entry.delivery_count >= self.max_deliveries {
            tracing::warn!(
                "Dead-lettering message {} on {}: {}",
                message_id.0,
                entry.topic,
                error
            );
            entry.status = DeliveryStatus::DeadLettered {
                error: error.to_string(),
            };
            entry.finished_at = Some(now_ms());
        } else {
            entry.status = DeliveryStatus::Pending;
        }

        Ok(())
    }

    /// Every message on a matching topic regardless of state, oldest first.
    pub fn messages_on(&self, pattern: &TopicPattern) -> Vec<Envelope> {
        let mut messages: Vec<Envelope> = self
            .messages
            .iter()
            .filter(|entry| pattern.matches(&entry.topic))
            .map(|entry| entry.value().clone())
            .collect();

        messages.sort_by_key(|envelope| envelope.created_at);
        messages
    }

    /// Forgets acknowledged and dead-lettered messages that finished more than `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(older_than.as_millis() as u64);
        let before = self.messages.len();
        self.messages
            .retain(|_, envelope| envelope.finished_at.map(|at| at > cutoff).unwrap_or(true));
        before - self.messages.len()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();

        for entry in self.messages.iter() {
            match entry.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::InFlight => stats.in_flight += 1,
                DeliveryStatus::Acked => stats.acked += 1,
                DeliveryStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }

        stats
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE, DEFAULT_MAX_DELIVERIES)
    }
}
