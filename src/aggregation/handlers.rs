use super::orchestrator::Orchestrator;
use super::protocol::*;
use super::service::{AggregationService, StartError};
use super::store::RECENT_JOBS_CAP;
use super::types::*;
use crate::queue::MessageQueue;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

pub async fn handle_start_aggregation(
    Extension(service): Extension<Arc<AggregationService>>,
    Json(req): Json<StartAggregationRequest>,
) -> Result<(StatusCode, Json<StartAggregationResponse>), (StatusCode, Json<ErrorResponse>)> {
    match service.start(req) {
        Ok(response) => {
            let status = if response.reused {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            Ok((status, Json(response)))
        }
        Err(StartError::Invalid(reason)) => {
            tracing::debug!("Rejected aggregation request: {}", reason);
            Err((StatusCode::BAD_REQUEST, Json(ErrorResponse { error: reason })))
        }
        Err(e) => {
            tracing::error!("Failed to start aggregation: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

pub async fn handle_get_aggregation(
    Extension(service): Extension<Arc<AggregationService>>,
    Path(job_id_str): Path<String>,
) -> (StatusCode, Json<Option<JobSnapshot>>) {
    let Ok(job_id) = job_id_str.parse::<JobId>() else {
        return (StatusCode::BAD_REQUEST, Json(None));
    };

    match service.status(&job_id) {
        Some(snapshot) => (StatusCode::OK, Json(Some(snapshot))),
        None => {
            tracing::debug!("Job not found: {}", job_id);
            (StatusCode::NOT_FOUND, Json(None))
        }
    }
}

pub async fn handle_recent_aggregations(
    Extension(service): Extension<Arc<AggregationService>>,
    Path(account): Path<String>,
    Query(query): Query<RecentJobsQuery>,
) -> Json<RecentJobsResponse> {
    let account = Account::new(&account);
    let limit = query.limit.unwrap_or(10).min(RECENT_JOBS_CAP);
    let jobs = service.recent(&account, limit);

    Json(RecentJobsResponse { account, jobs })
}

pub async fn handle_queue_stats(
    Extension(queue): Extension<Arc<MessageQueue>>,
) -> Json<QueueStatsResponse> {
    Json(QueueStatsResponse {
        stats: queue.stats(),
    })
}

/// The public HTTP surface of a node.
pub fn router(orchestrator: &Orchestrator) -> Router {
    Router::new()
        .route(ENDPOINT_AGGREGATIONS, post(handle_start_aggregation))
        .route(ENDPOINT_AGGREGATION_STATUS, get(handle_get_aggregation))
        .route(ENDPOINT_ACCOUNT_AGGREGATIONS, get(handle_recent_aggregations))
        .route(ENDPOINT_QUEUE_STATS, get(handle_queue_stats))
        .layer(Extension(orchestrator.service.clone()))
        .layer(Extension(orchestrator.queue.clone()))
}
