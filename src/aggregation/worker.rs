//! Request Worker
//!
//! Executes one work item per request message: calls the provider, retries retryable
//! failures with backoff, follows up on expansion hints and publishes exactly one terminal
//! result per work item.
//!
//! ## Retry policy
//! - Permanent provider errors are never retried.
//! - Transient errors and timeouts are re-published as the next attempt after
//!   `retry_delay(attempt)` plus up to 10% jitter, until `max_attempts` is reached.
//! - At the cap, a timeout becomes `TimedOut` and anything else `Failed`.

use super::dispatcher::Dispatcher;
use super::expansion::JobExpander;
use super::protocol::*;
use super::types::WorkOutcome;
use crate::config::AggregatorConfig;
use crate::providers::registry::ProviderResult;
use crate::providers::{ProviderError, ProviderRegistry, ProviderRequest};
use crate::queue::MessageQueue;
use crate::storage::now_ms;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// What the worker did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    /// A terminal result was published.
    Completed(WorkOutcome),
    /// The next attempt was scheduled after the given delay.
    Retried { next_attempt: u32, delay: Duration },
}

pub struct RequestWorker {
    providers: Arc<ProviderRegistry>,
    queue: Arc<MessageQueue>,
    dispatcher: Arc<Dispatcher>,
    expander: Arc<JobExpander>,
    config: Arc<AggregatorConfig>,
}

impl RequestWorker {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        queue: Arc<MessageQueue>,
        dispatcher: Arc<Dispatcher>,
        expander: Arc<JobExpander>,
        config: Arc<AggregatorConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            providers,
            queue,
            dispatcher,
            expander,
            config,
        })
    }

    pub async fn handle(&self, request: RequestMessage) -> Result<WorkerAction> {
        // 1. Call the provider under the configured timeout
        let started_at = now_ms();
        let outcome = self.invoke(&request).await;
        let finished_at = now_ms();

        let result = match outcome {
            Ok(response) => {
                // 2. Follow-ups join the job before this item's result can drain it
                if let Err(e) = self.expander.expand(&request.job_id, response.follow_ups) {
                    tracing::warn!("Expansion of job {} failed: {:#}", request.job_id, e);
                }

                let payload = serde_json::to_value(&response.payload)?;
                ResultMessage::for_request(&request, WorkOutcome::Success, started_at, finished_at)
                    .with_payload(payload)
            }
            Err(error) => {
                // 3. Retryable and below the cap: schedule the next attempt, no result yet
                if !error.is_permanent() && request.attempt < self.config.max_attempts {
                    let delay = self.backoff(request.attempt);
                    self.dispatcher.retry(&request, delay)?;

                    tracing::warn!(
                        "{} attempt {} for job {} failed ({}), retrying in {:?}",
                        request.work_key(),
                        request.attempt,
                        request.job_id,
                        error,
                        delay
                    );
                    return Ok(WorkerAction::Retried {
                        next_attempt: request.attempt + 1,
                        delay,
                    });
                }

                // 4. Permanent, or out of attempts
                let status = terminal_outcome(&error);
                tracing::warn!(
                    "{} for job {} gave up after attempt {}: {}",
                    request.work_key(),
                    request.job_id,
                    request.attempt,
                    error
                );
                ResultMessage::for_request(&request, status, started_at, finished_at)
                    .with_error(&error)
            }
        };

        // Exactly one terminal result per work item
        self.queue.publish(&result_topic(&request.provider), &result)?;
        Ok(WorkerAction::Completed(result.status))
    }

    async fn invoke(&self, request: &RequestMessage) -> ProviderResult {
        let provider_request = ProviderRequest {
            provider: request.provider.clone(),
            account: request.account.clone(),
            chain: request.chain.clone(),
            attempt: request.attempt,
        };

        let call = self.providers.invoke(provider_request);
        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "no answer within {:?}",
                self.config.provider_timeout
            ))),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay(attempt);
        let base_ms = base.as_millis() as u64;
        if base_ms == 0 {
            return base;
        }
        // Up to 10% jitter
        let jitter_ms = rand::random::<u64>() % (base_ms / 10 + 1);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Outcome recorded for an error that will not be retried.
pub fn terminal_outcome(error: &ProviderError) -> WorkOutcome {
    match error {
        ProviderError::Cancelled(_) => WorkOutcome::Cancelled,
        ProviderError::Timeout(_) => WorkOutcome::TimedOut,
        _ => WorkOutcome::Failed,
    }
}
