use super::dispatcher::Dispatcher;
use super::store::JobStore;
use super::types::*;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Grows a running job with follow-up work items discovered by providers.
pub struct JobExpander {
    store: Arc<JobStore>,
    dispatcher: Arc<Dispatcher>,
    ttl_margin: Duration,
}

impl JobExpander {
    pub fn new(store: Arc<JobStore>, dispatcher: Arc<Dispatcher>, ttl_margin: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher,
            ttl_margin,
        })
    }

    /// Adds the candidates the job does not know yet and dispatches them.
    ///
    /// A job that is gone, finalized or about to expire is left untouched and an empty
    /// list is returned. Only publishing failures are errors.
    pub fn expand(&self, job_id: &JobId, candidates: Vec<WorkKey>) -> Result<Vec<WorkKey>> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let added = match self.store.expand(job_id, candidates, self.ttl_margin) {
            Ok(added) => added,
            Err(e) => {
                tracing::debug!("Skipping expansion: {}", e);
                return Ok(vec![]);
            }
        };

        if added.is_empty() {
            return Ok(added);
        }

        // Expansion just succeeded under the job lock, so the meta is still there.
        let Some(meta) = self.store.get_meta(job_id) else {
            return Ok(vec![]);
        };
        self.dispatcher.dispatch(&meta, &added, "expansion")?;

        tracing::info!(
            "Expanded job {} by {} work items (total {})",
            job_id,
            added.len(),
            meta.expected_total
        );
        Ok(added)
    }
}
