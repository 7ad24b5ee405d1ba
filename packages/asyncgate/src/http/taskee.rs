//! TASKEE routes (spec §4.6): claim, renew, progress-report, and resolve leases.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::common::entity_ids::{LeaseId, TaskId};
use crate::engine::{ClaimTasksInput, ClaimedLease, CompleteInput, FailInput};

use super::extractors::ResolvedTenant;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ClaimTasksRequest {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub accept_types: Option<Vec<String>>,
    pub max_tasks: i64,
    pub lease_ttl_seconds: Option<i64>,
}

pub async fn claim_tasks(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Json(body): Json<ClaimTasksRequest>,
) -> Result<Response, Response> {
    let leases: Vec<ClaimedLease> = state
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: &body.worker_id,
            capabilities: body.capabilities,
            accept_types: body.accept_types,
            max_tasks: body.max_tasks,
            lease_ttl_seconds: body.lease_ttl_seconds,
        })
        .await
        .map_err(|e| e.into_response())?;

    if !leases.is_empty() {
        for _ in 0..leases.len() {
            state.metrics.record_task_claimed();
        }
    }

    Ok(Json(serde_json::json!({ "leases": leases.into_iter().map(lease_json).collect::<Vec<_>>() })).into_response())
}

fn lease_json(lease: ClaimedLease) -> Value {
    serde_json::json!({
        "task_id": lease.task_id,
        "lease_id": lease.lease_id,
        "type": lease.task_type,
        "payload": lease.payload,
        "payload_pointer": lease.payload_pointer,
        "principal_ai": lease.principal_ai,
        "attempt": lease.attempt,
        "expires_at": lease.expires_at,
        "requirements": lease.requirements,
        "expected_outcome_kind": lease.expected_outcome_kind,
        "expected_artifact_mime": lease.expected_artifact_mime,
    })
}

#[derive(Debug, Deserialize)]
pub struct LeaseScopedRequest {
    pub task_id: Uuid,
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenewLeaseRequest {
    pub task_id: Uuid,
    pub worker_id: String,
    pub extend_by_seconds: Option<i64>,
}

pub async fn renew_lease(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(lease_id): Path<Uuid>,
    Json(body): Json<RenewLeaseRequest>,
) -> Result<Response, Response> {
    let lease = state
        .engine
        .renew_lease(
            tenant_id,
            TaskId::from_uuid(body.task_id),
            LeaseId::from_uuid(lease_id),
            &body.worker_id,
            body.extend_by_seconds,
        )
        .await
        .map_err(|e| e.into_response())?;
    Ok(Json(lease).into_response())
}

pub async fn start_task(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(lease_id): Path<Uuid>,
    Json(body): Json<LeaseScopedRequest>,
) -> Result<Response, Response> {
    let task = state
        .engine
        .start_task(tenant_id, TaskId::from_uuid(body.task_id), LeaseId::from_uuid(lease_id), &body.worker_id)
        .await
        .map_err(|e| e.into_response())?;
    Ok(Json(task).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ReportProgressRequest {
    pub task_id: Uuid,
    pub worker_id: String,
    pub progress: Value,
}

pub async fn report_progress(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(lease_id): Path<Uuid>,
    Json(body): Json<ReportProgressRequest>,
) -> Result<Response, Response> {
    let row = state
        .engine
        .report_progress(
            tenant_id,
            TaskId::from_uuid(body.task_id),
            LeaseId::from_uuid(lease_id),
            &body.worker_id,
            body.progress,
        )
        .await
        .map_err(|e| e.into_response())?;
    Ok(Json(row).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub task_id: Uuid,
    pub worker_id: String,
    pub result_summary: Value,
    pub result_payload: Option<Value>,
    pub artifacts: Option<Value>,
    pub delivery_proof: Option<Value>,
    pub metadata: Option<Value>,
}

pub async fn complete(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(lease_id): Path<Uuid>,
    Json(body): Json<CompleteRequest>,
) -> Result<Response, Response> {
    let (task, outcome) = state
        .engine
        .complete(CompleteInput {
            tenant_id,
            task_id: TaskId::from_uuid(body.task_id),
            lease_id: LeaseId::from_uuid(lease_id),
            worker_id: &body.worker_id,
            result_summary: body.result_summary,
            result_payload: body.result_payload,
            artifacts: body.artifacts,
            delivery_proof: body.delivery_proof,
            metadata: body.metadata,
        })
        .await
        .map_err(|e| e.into_response())?;
    state.metrics.record_task_completed();
    Ok(Json(serde_json::json!({
        "task": task,
        "anomaly": outcome.anomaly.is_some(),
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub task_id: Uuid,
    pub worker_id: String,
    pub retryable: bool,
    pub error: Value,
}

#[derive(Debug, Serialize)]
pub struct FailResponse {
    pub ok: bool,
    pub requeued: bool,
    pub next_eligible_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn fail(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(lease_id): Path<Uuid>,
    Json(body): Json<FailRequest>,
) -> Result<Response, Response> {
    let outcome = state
        .engine
        .fail(FailInput {
            tenant_id,
            task_id: TaskId::from_uuid(body.task_id),
            lease_id: LeaseId::from_uuid(lease_id),
            worker_id: &body.worker_id,
            retryable: body.retryable,
            error: body.error,
        })
        .await
        .map_err(|e| e.into_response())?;
    if !outcome.requeued {
        state.metrics.record_task_failed();
    }
    Ok(Json(FailResponse {
        ok: true,
        requeued: outcome.requeued,
        next_eligible_at: outcome.next_eligible_at,
    })
    .into_response())
}
