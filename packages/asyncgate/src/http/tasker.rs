//! TASKER routes (spec §4.6): create, inspect, cancel tasks; read receipts and
//! open obligations.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::common::entity_ids::TaskId;
use crate::common::pagination::{paginate, PageArgs};
use crate::engine::{CancelTaskInput, CreateTaskInput};
use crate::storage::models::TaskStatus;
use crate::storage::TaskFilters;

use super::extractors::{bad_request, Authenticated, ResolvedTenant};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub principal_ai: String,
    pub requirements: Option<Value>,
    pub priority: Option<i32>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<i32>,
    pub retry_backoff_seconds: Option<i32>,
    pub delay_seconds: Option<i64>,
    pub expected_outcome_kind: Option<String>,
    pub expected_artifact_mime: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub created: bool,
}

pub async fn create_task(
    State(state): State<AppState>,
    Authenticated(auth): Authenticated,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Response, Response> {
    let outcome = state
        .engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: &body.task_type,
            payload: body.payload,
            created_by: &auth.principal,
            caller_is_internal: auth.is_internal,
            principal_ai: &body.principal_ai,
            requirements: body.requirements,
            priority: body.priority,
            idempotency_key: body.idempotency_key.as_deref(),
            max_attempts: body.max_attempts,
            retry_backoff_seconds: body.retry_backoff_seconds,
            delay_seconds: body.delay_seconds,
            expected_outcome_kind: body.expected_outcome_kind.as_deref(),
            expected_artifact_mime: body.expected_artifact_mime.as_deref(),
        })
        .await
        .map_err(|e| e.into_response())?;

    if outcome.created {
        state.metrics.record_task_created();
    }

    Ok(Json(CreateTaskResponse {
        task_id: outcome.task_id,
        status: outcome.status,
        created: outcome.created,
    })
    .into_response())
}

pub async fn get_task(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(task_id): Path<Uuid>,
) -> Result<Response, Response> {
    let task = state
        .engine
        .get_task(tenant_id, TaskId::from_uuid(task_id))
        .await
        .map_err(|e| e.into_response())?
        .ok_or_else(|| crate::error::AsyncGateError::TaskNotFound.into_response())?;
    Ok(Json(task).into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub created_by_id: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub items: Vec<crate::storage::models::TaskRow>,
    pub next_cursor: Option<String>,
}

/// Tasks cursor on `created_at` rather than an opaque row id (spec §6: "a
/// receipt_id or created_at of the boundary row") — a base64 RFC 3339 instant,
/// since `TaskFilters`/`list_tasks` filter with `created_at < cursor` directly.
fn decode_created_at_cursor(cursor: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let bytes = URL_SAFE_NO_PAD.decode(cursor)?;
    let s = String::from_utf8(bytes)?;
    Ok(chrono::DateTime::parse_from_rfc3339(&s)?.with_timezone(&chrono::Utc))
}

fn encode_created_at_cursor(at: chrono::DateTime<chrono::Utc>) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(at.to_rfc3339())
}

pub async fn list_tasks(
    State(state): State<AppState>,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Query(query): Query<ListTasksQuery>,
) -> Result<Response, Response> {
    let limit = query
        .limit
        .unwrap_or(state.config.page_limit_default)
        .clamp(1, state.config.page_limit_max);
    let cursor = query
        .cursor
        .as_deref()
        .map(decode_created_at_cursor)
        .transpose()
        .map_err(|e| bad_request(format!("invalid cursor: {e}")))?;

    let filters = TaskFilters {
        status: query.status,
        task_type: query.task_type,
        created_by_id: query.created_by_id,
    };
    let mut rows = state
        .engine
        .list_tasks(tenant_id, &filters, cursor, limit + 1)
        .await
        .map_err(|e| e.into_response())?;

    let has_more = rows.len() as i64 > limit;
    if has_more {
        rows.truncate(limit as usize);
    }
    let next_cursor = if has_more {
        rows.last().map(|row| encode_created_at_cursor(row.created_at))
    } else {
        None
    };
    Ok(Json(ListTasksResponse {
        items: rows,
        next_cursor,
    })
    .into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelTaskRequest {
    pub reason: Option<Value>,
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Authenticated(auth): Authenticated,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(task_id): Path<Uuid>,
    Json(body): Json<CancelTaskRequest>,
) -> Result<Response, Response> {
    let task = state
        .engine
        .cancel_task(CancelTaskInput {
            tenant_id,
            task_id: TaskId::from_uuid(task_id),
            caller: &auth.principal,
            caller_is_internal: auth.is_internal,
            reason: body.reason,
        })
        .await
        .map_err(|e| e.into_response())?;
    if task.status == TaskStatus::Canceled {
        state.metrics.record_task_canceled();
    }
    Ok(Json(task).into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct ListReceiptsQuery {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_receipts(
    State(state): State<AppState>,
    Authenticated(auth): Authenticated,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Query(query): Query<ListReceiptsQuery>,
) -> Result<Response, Response> {
    let page_args = PageArgs {
        cursor: query.cursor,
        limit: query.limit,
    };
    let validated = page_args.validate().map_err(|e| bad_request(e.to_string()))?;
    let rows = state
        .engine
        .list_receipts(tenant_id, &auth.principal, query.since, validated.fetch_limit())
        .await
        .map_err(|e| e.into_response())?;
    let page = paginate(rows, validated.limit, |row| row.receipt_id.into_uuid());
    Ok(Json(serde_json::json!({
        "items": page.items,
        "next_cursor": page.next_cursor,
    }))
    .into_response())
}

pub async fn ack_receipt(
    State(state): State<AppState>,
    Authenticated(auth): Authenticated,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Path(receipt_id): Path<Uuid>,
) -> Result<Response, Response> {
    let receipt = state
        .engine
        .ack_receipt(tenant_id, receipt_id, &auth.principal)
        .await
        .map_err(|e| e.into_response())?;
    Ok(Json(receipt).into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct ListObligationsQuery {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_open_obligations(
    State(state): State<AppState>,
    Authenticated(auth): Authenticated,
    ResolvedTenant(tenant_id): ResolvedTenant,
    Query(query): Query<ListObligationsQuery>,
) -> Result<Response, Response> {
    let limit = query
        .limit
        .unwrap_or(state.config.page_limit_default)
        .clamp(1, state.config.page_limit_max);
    let obligations = state
        .engine
        .list_open_obligations(tenant_id, &auth.principal, query.since, limit)
        .await
        .map_err(|e| e.into_response())?;
    Ok(Json(serde_json::json!({ "items": obligations })).into_response())
}
