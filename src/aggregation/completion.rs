use super::protocol::*;
use super::store::JobStore;
use super::types::JobMeta;
use crate::queue::MessageQueue;

use anyhow::Result;
use std::sync::Arc;

/// Announces finalized jobs: releases the active-job pointer and publishes the
/// completion event.
///
/// Callers only invoke this with the meta returned by a successful finalize transition,
/// which happens once per job.
pub struct CompletionNotifier {
    store: Arc<JobStore>,
    queue: Arc<MessageQueue>,
}

impl CompletionNotifier {
    pub fn new(store: Arc<JobStore>, queue: Arc<MessageQueue>) -> Arc<Self> {
        Arc::new(Self { store, queue })
    }

    pub fn announce(&self, meta: &JobMeta) -> Result<()> {
        self.store.clear_active_pointer(meta);

        let event = CompletionEvent::from_meta(meta);
        self.queue.publish(TOPIC_COMPLETED, &event)?;

        tracing::info!(
            "Job {} finished as {:?}: {} ok, {} failed, {} timed out of {}",
            event.job_id,
            event.status,
            event.succeeded,
            event.failed,
            event.timed_out,
            event.total
        );
        Ok(())
    }
}
