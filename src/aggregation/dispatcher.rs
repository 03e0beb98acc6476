use super::protocol::*;
use super::types::*;
use crate::queue::{MessageId, MessageQueue};
use crate::storage::now_ms;

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Publishes work item requests onto the per-provider request topics.
pub struct Dispatcher {
    queue: Arc<MessageQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<MessageQueue>) -> Arc<Self> {
        Arc::new(Self { queue })
    }

    /// Publishes attempt 1 of every work item. `origin` is carried in the metadata so a
    /// worker can tell initial requests from expansion follow-ups.
    pub fn dispatch(&self, meta: &JobMeta, work_items: &[WorkKey], origin: &str) -> Result<usize> {
        let requested_at = now_ms();

        for work_key in work_items {
            let request = RequestMessage {
                job_id: meta.job_id,
                request_id: uuid::Uuid::new_v4().to_string(),
                account: meta.account.clone(),
                chains: meta.chains.clone(),
                chain: work_key.chain.clone(),
                provider: work_key.provider.clone(),
                attempt: 1,
                requested_at,
                metadata: BTreeMap::from([("origin".to_string(), origin.to_string())]),
            };
            self.queue.publish(&request_topic(&work_key.provider), &request)?;
        }

        tracing::debug!(
            "Dispatched {} work items for job {} ({})",
            work_items.len(),
            meta.job_id,
            origin
        );
        Ok(work_items.len())
    }

    /// Re-publishes a request as its next attempt, invisible for `delay`.
    pub fn retry(&self, request: &RequestMessage, delay: Duration) -> Result<MessageId> {
        let next = request.next_attempt(now_ms());
        self.queue
            .publish_delayed(&request_topic(&next.provider), &next, delay)
    }
}
