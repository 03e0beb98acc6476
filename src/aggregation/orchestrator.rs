//! Pipeline Wiring
//!
//! Builds every stage of the aggregation pipeline around one queue and one job store and
//! owns the consumer pools that connect them:
//!
//! ```text
//! start ──► integration.request.{provider} ──► RequestWorker ──► integration.result.{provider}
//!                  ▲        (retries)               │                       │
//!                  └──────── JobExpander ◄──────────┘                       ▼
//!                                                   aggregation.completed ◄── ResultAggregator
//!                                                            ▲
//!                                                     TimeoutSweeper
//! ```

use super::aggregator::ResultAggregator;
use super::completion::CompletionNotifier;
use super::dispatcher::Dispatcher;
use super::expansion::JobExpander;
use super::protocol::*;
use super::service::AggregationService;
use super::store::JobStore;
use super::sweeper::TimeoutSweeper;
use super::worker::RequestWorker;
use crate::config::AggregatorConfig;
use crate::providers::{PayloadMapper, ProviderRegistry};
use crate::queue::{Envelope, MessageQueue, QueueConsumer, TopicPattern};

use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Orchestrator {
    pub config: Arc<AggregatorConfig>,
    pub queue: Arc<MessageQueue>,
    pub store: Arc<JobStore>,
    pub providers: Arc<ProviderRegistry>,
    pub service: Arc<AggregationService>,
    pub worker: Arc<RequestWorker>,
    pub aggregator: Arc<ResultAggregator>,
    pub sweeper: Arc<TimeoutSweeper>,
    pub request_consumer: Arc<QueueConsumer>,
    pub result_consumer: Arc<QueueConsumer>,
    pub completion_consumer: Arc<QueueConsumer>,
}

impl Orchestrator {
    pub fn new(
        config: AggregatorConfig,
        providers: Arc<ProviderRegistry>,
        mapper: Arc<dyn PayloadMapper>,
    ) -> Self {
        let config = Arc::new(config);
        let queue = Arc::new(MessageQueue::new(config.lease, config.max_deliveries));
        let store = Arc::new(JobStore::new());

        let dispatcher = Dispatcher::new(queue.clone());
        let notifier = CompletionNotifier::new(store.clone(), queue.clone());
        let expander = JobExpander::new(
            store.clone(),
            dispatcher.clone(),
            config.expansion_ttl_margin,
        );

        let service = AggregationService::new(
            store.clone(),
            providers.clone(),
            dispatcher.clone(),
            notifier.clone(),
            config.job_ttl,
        );
        let worker = RequestWorker::new(
            providers.clone(),
            queue.clone(),
            dispatcher,
            expander,
            config.clone(),
        );
        let aggregator = ResultAggregator::new(store.clone(), mapper, notifier.clone());
        let sweeper = TimeoutSweeper::new(
            store.clone(),
            queue.clone(),
            notifier,
            config.sweep_interval,
            config.job_timeout,
            config.job_ttl,
        );

        let request_worker = worker.clone();
        let request_consumer = QueueConsumer::new(
            "provider-requests",
            queue.clone(),
            TopicPattern::new(TOPIC_REQUEST_ALL),
            config.request_workers,
            move |envelope: Envelope| {
                let worker = request_worker.clone();
                async move {
                    let request: RequestMessage = envelope.decode()?;
                    worker.handle(request).await?;
                    Ok(())
                }
            },
        );

        let result_aggregator = aggregator.clone();
        let result_consumer = QueueConsumer::new(
            "provider-results",
            queue.clone(),
            TopicPattern::new(TOPIC_RESULT_ALL),
            config.result_workers,
            move |envelope: Envelope| {
                let aggregator = result_aggregator.clone();
                async move {
                    let result: ResultMessage = envelope.decode()?;
                    aggregator.handle(result)?;
                    Ok(())
                }
            },
        );

        let completion_consumer = QueueConsumer::new(
            "completion-log",
            queue.clone(),
            TopicPattern::new(TOPIC_COMPLETED),
            1,
            |envelope: Envelope| async move {
                let event: CompletionEvent = envelope.decode()?;
                tracing::debug!(
                    "Completion event for job {} ({:?}) of {}",
                    event.job_id,
                    event.status,
                    event.account
                );
                Ok(())
            },
        );

        Self {
            config,
            queue,
            store,
            providers,
            service,
            worker,
            aggregator,
            sweeper,
            request_consumer,
            result_consumer,
            completion_consumer,
        }
    }

    /// Spawns the consumer pools and the sweeper.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.request_consumer.clone().start();
        handles.extend(self.result_consumer.clone().start());
        handles.extend(self.completion_consumer.clone().start());
        handles.push(self.sweeper.clone().start());
        handles
    }

    /// Runs requests and results in the current task until neither topic has an
    /// available message. Returns how many messages were processed.
    pub async fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = self.request_consumer.drain().await + self.result_consumer.drain().await;
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }
}
