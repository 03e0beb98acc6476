//! Result Aggregator
//!
//! Folds terminal work item results into their job. Each result is recorded write-once,
//! so duplicate deliveries are dropped before they can touch the counters; the fold and
//! the possible finalization then happen in one atomic store operation.

use super::completion::CompletionNotifier;
use super::protocol::ResultMessage;
use super::store::{JobStore, Resolution};
use super::types::*;
use crate::providers::{PayloadMapper, ProviderPayload};

use anyhow::Result;
use std::sync::Arc;

/// What happened to one result message.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultDisposition {
    /// The job expired or never existed.
    JobGone,
    /// A result for this work item was already recorded.
    Duplicate,
    Counted { finalized: bool },
    /// Late result for an item the sweeper had timed out.
    Straggler { upgraded: bool },
    /// The work item does not belong to the job.
    Unknown,
}

pub struct ResultAggregator {
    store: Arc<JobStore>,
    mapper: Arc<dyn PayloadMapper>,
    notifier: Arc<CompletionNotifier>,
}

impl ResultAggregator {
    pub fn new(
        store: Arc<JobStore>,
        mapper: Arc<dyn PayloadMapper>,
        notifier: Arc<CompletionNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            mapper,
            notifier,
        })
    }

    pub fn handle(&self, result: ResultMessage) -> Result<ResultDisposition> {
        let job_id = result.job_id;
        let work_key = result.work_key();

        // Results share the job's remaining lifetime
        let Some(ttl) = self.store.job_ttl(&job_id) else {
            tracing::debug!("Dropping result {} for unknown job {}", work_key, job_id);
            return Ok(ResultDisposition::JobGone);
        };

        // Idempotency gate: only the first delivery of a result gets past here
        if !self
            .store
            .record_result(&job_id, &work_key, result.to_record(), ttl)
        {
            tracing::debug!("Duplicate result {} for job {}", work_key, job_id);
            return Ok(ResultDisposition::Duplicate);
        }

        let items = self.items_of(&result);

        // Fold into the job under its lock
        match self
            .store
            .resolve_work_item(&job_id, &work_key, result.status, items)?
        {
            Resolution::Counted { finalized: None } => Ok(ResultDisposition::Counted { finalized: false }),
            Resolution::Counted {
                finalized: Some(meta),
            } => {
                // Only the finalizing writer gets here, so one announcement per job
                self.notifier.announce(&meta)?;
                Ok(ResultDisposition::Counted { finalized: true })
            }
            Resolution::Reclassified { upgraded } => {
                if upgraded {
                    tracing::info!(
                        "Job {} upgraded to completed by late result {}",
                        job_id,
                        work_key
                    );
                }
                Ok(ResultDisposition::Straggler { upgraded })
            }
            Resolution::Ignored => {
                tracing::warn!("Result {} is not part of job {}", work_key, job_id);
                Ok(ResultDisposition::Unknown)
            }
        }
    }

    fn items_of(&self, result: &ResultMessage) -> Vec<WalletItem> {
        if result.status != WorkOutcome::Success {
            return vec![];
        }
        let Some(raw) = &result.payload else {
            return vec![];
        };

        match serde_json::from_value::<ProviderPayload>(raw.clone()) {
            Ok(payload) => self.mapper.map(&result.provider, &payload, &result.chain),
            Err(e) => {
                tracing::warn!(
                    "Unreadable payload from {} for job {}: {}",
                    result.work_key(),
                    result.job_id,
                    e
                );
                vec![]
            }
        }
    }
}
