use super::completion::CompletionNotifier;
use super::store::JobStore;
use crate::queue::MessageQueue;
use crate::storage::now_ms;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodically force-finalizes jobs that outlived the job timeout and drops expired state.
pub struct TimeoutSweeper {
    store: Arc<JobStore>,
    queue: Arc<MessageQueue>,
    notifier: Arc<CompletionNotifier>,
    interval: Duration,
    job_timeout: Duration,
    /// Settled queue messages older than this are purged.
    retention: Duration,
}

impl TimeoutSweeper {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<MessageQueue>,
        notifier: Arc<CompletionNotifier>,
        interval: Duration,
        job_timeout: Duration,
        retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            notifier,
            interval,
            job_timeout,
            retention,
        })
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!(
            "Timeout sweeper running every {:?} (job timeout {:?})",
            self.interval,
            self.job_timeout
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                let swept = self.sweep();
                if swept > 0 {
                    tracing::info!("Sweeper timed out {} jobs", swept);
                }
            }
        })
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(now_ms())
    }

    /// One sweep pass as of `now`. Returns how many jobs were finalized.
    pub fn sweep_at(&self, now: u64) -> usize {
        let purged = self.store.purge_expired() + self.queue.purge_finished(self.retention);
        if purged > 0 {
            tracing::debug!("Purged {} expired entries", purged);
        }

        let mut finalized = 0;
        for job_id in self.store.stale_jobs(now, self.job_timeout) {
            // Re-checked under the job lock; a result may have finalized it meanwhile.
            let Some(swept) = self.store.sweep_job(&job_id, now, self.job_timeout) else {
                continue;
            };
            finalized += 1;

            tracing::warn!(
                "Job {} timed out with {} of {} work items outstanding",
                job_id,
                swept.swept,
                swept.meta.expected_total
            );
            if let Err(e) = self.notifier.announce(&swept.meta) {
                tracing::error!("Failed to announce timed out job {}: {:#}", job_id, e);
            }
        }

        finalized
    }
}
