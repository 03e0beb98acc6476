//! Message and API Contracts
//!
//! Topic names and the Data Transfer Objects exchanged over the queue between the
//! aggregation stages, plus the HTTP request/response bodies.

use super::types::*;
use crate::providers::ProviderError;
use crate::queue::QueueStats;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Topics ---

pub const TOPIC_REQUEST_PREFIX: &str = "integration.request";
pub const TOPIC_RESULT_PREFIX: &str = "integration.result";
/// Subscription for every provider's work item requests.
pub const TOPIC_REQUEST_ALL: &str = "integration.request.*";
/// Subscription for every provider's terminal results.
pub const TOPIC_RESULT_ALL: &str = "integration.result.*";
pub const TOPIC_COMPLETED: &str = "aggregation.completed";

pub fn request_topic(provider: &ProviderId) -> String {
    format!("{}.{}", TOPIC_REQUEST_PREFIX, provider)
}

pub fn result_topic(provider: &ProviderId) -> String {
    format!("{}.{}", TOPIC_RESULT_PREFIX, provider)
}

// --- API Endpoints ---

pub const ENDPOINT_AGGREGATIONS: &str = "/aggregations";
pub const ENDPOINT_AGGREGATION_STATUS: &str = "/aggregations/:job_id";
pub const ENDPOINT_ACCOUNT_AGGREGATIONS: &str = "/accounts/:account/aggregations";
pub const ENDPOINT_QUEUE_STATS: &str = "/queue/stats";

// --- Queue messages ---

/// One work item dispatched to a provider worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub job_id: JobId,
    /// Stable across retries of the same work item.
    pub request_id: String,
    pub account: Account,
    pub chains: Vec<ChainId>,
    pub chain: ChainId,
    pub provider: ProviderId,
    pub attempt: u32,
    pub requested_at: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RequestMessage {
    pub fn work_key(&self) -> WorkKey {
        WorkKey {
            provider: self.provider.clone(),
            chain: self.chain.clone(),
        }
    }

    /// The same work item, one attempt later.
    pub fn next_attempt(&self, requested_at: u64) -> Self {
        Self {
            attempt: self.attempt + 1,
            requested_at,
            ..self.clone()
        }
    }
}

/// Terminal outcome of one work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub job_id: JobId,
    pub request_id: String,
    pub account: Account,
    pub chains: Vec<ChainId>,
    pub chain: ChainId,
    pub provider: ProviderId,
    pub status: WorkOutcome,
    pub attempt: u32,
    pub started_at: u64,
    pub finished_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ResultMessage {
    pub fn for_request(
        request: &RequestMessage,
        status: WorkOutcome,
        started_at: u64,
        finished_at: u64,
    ) -> Self {
        Self {
            job_id: request.job_id,
            request_id: request.request_id.clone(),
            account: request.account.clone(),
            chains: request.chains.clone(),
            chain: request.chain.clone(),
            provider: request.provider.clone(),
            status,
            attempt: request.attempt,
            started_at,
            finished_at,
            error_code: None,
            error_message: None,
            payload: None,
        }
    }

    pub fn with_error(mut self, error: &ProviderError) -> Self {
        self.error_code = Some(error.code().to_string());
        self.error_message = Some(error.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn work_key(&self) -> WorkKey {
        WorkKey {
            provider: self.provider.clone(),
            chain: self.chain.clone(),
        }
    }

    pub fn to_record(&self) -> WorkResult {
        WorkResult {
            outcome: self.status,
            attempt: self.attempt,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_code: self.error_code.clone(),
            error_message: self.error_message.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Published exactly once per job when it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub account: Account,
    pub status: JobStatus,
    pub completed_at: u64,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub timed_out: u32,
}

impl CompletionEvent {
    pub fn from_meta(meta: &JobMeta) -> Self {
        let completed_at = match meta.state {
            JobState::Finalized { finalized_at, .. } => finalized_at,
            JobState::Running => crate::storage::now_ms(),
        };

        Self {
            job_id: meta.job_id,
            account: meta.account.clone(),
            status: meta.status(),
            completed_at,
            total: meta.expected_total,
            succeeded: meta.succeeded,
            failed: meta.failed,
            timed_out: meta.timed_out,
        }
    }
}

// --- HTTP DTOs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAggregationRequest {
    pub account: String,
    pub chains: Vec<String>,
    /// Restrict to these providers; all registered providers when absent.
    #[serde(default)]
    pub providers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartAggregationResponse {
    pub job_id: JobId,
    /// `true` when an in-flight job for the same account and chains was returned.
    pub reused: bool,
    pub expected_total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentJobsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentJobsResponse {
    pub account: Account,
    pub jobs: Vec<JobMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    #[serde(flatten)]
    pub stats: QueueStats,
}
