use super::completion::CompletionNotifier;
use super::dispatcher::Dispatcher;
use super::protocol::*;
use super::store::{JobStore, StoreError};
use super::types::*;
use crate::providers::ProviderRegistry;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Entry point for clients: starts (or joins) aggregation jobs and answers status queries.
pub struct AggregationService {
    store: Arc<JobStore>,
    providers: Arc<ProviderRegistry>,
    dispatcher: Arc<Dispatcher>,
    notifier: Arc<CompletionNotifier>,
    job_ttl: Duration,
}

impl AggregationService {
    pub fn new(
        store: Arc<JobStore>,
        providers: Arc<ProviderRegistry>,
        dispatcher: Arc<Dispatcher>,
        notifier: Arc<CompletionNotifier>,
        job_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            providers,
            dispatcher,
            notifier,
            job_ttl,
        })
    }

    /// Starts an aggregation for an account, or returns the job already running for the
    /// same account and chain set.
    pub fn start(&self, request: StartAggregationRequest) -> Result<StartAggregationResponse, StartError> {
        let account = Account::new(&request.account);
        if account.as_str().is_empty() {
            return Err(StartError::Invalid("account is required".to_string()));
        }

        let chains = normalize_chains(&request.chains);
        if chains.is_empty() {
            return Err(StartError::Invalid("at least one chain is required".to_string()));
        }

        let selected: Option<Vec<ProviderId>> = request
            .providers
            .map(|providers| providers.iter().map(|p| ProviderId::new(p)).collect());
        let work_items = self.providers.work_items(selected.as_deref(), &chains);

        let outcome = self
            .store
            .create_or_reuse(&account, &chains, work_items.clone(), self.job_ttl);

        // Only the creator dispatches; a reused job is already in flight.
        if outcome.created {
            if work_items.is_empty() {
                tracing::info!("Job {} has no work items, finalizing", outcome.job_id);
                if let Some(meta) = self.store.finalize_if_drained(&outcome.job_id)? {
                    self.notifier.announce(&meta)?;
                }
            } else {
                self.dispatcher.dispatch(&outcome.meta, &work_items, "start")?;
            }
        }

        Ok(StartAggregationResponse {
            job_id: outcome.job_id,
            reused: !outcome.created,
            expected_total: outcome.meta.expected_total,
        })
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.store.snapshot(job_id)
    }

    pub fn recent(&self, account: &Account, limit: usize) -> Vec<JobMeta> {
        self.store.list_recent_jobs(account, limit)
    }
}
