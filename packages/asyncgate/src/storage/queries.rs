//! Raw SQL for every Storage operation in spec §4.1.
//!
//! Every function takes `&mut PgConnection` rather than a generic executor: both
//! `PoolConnection<Postgres>` and `Transaction<'_, Postgres>` deref to it, so a
//! caller reborrows (`&mut *conn`, `&mut *tx`) to run several of these as one
//! transaction or savepoint — the Task Engine's state-change-plus-receipt
//! operations (spec §4.3, §5 "Transaction discipline") compose this way.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::common::entity_ids::{LeaseId, ReceiptId, TaskId, TenantId};
use crate::common::principal::{Principal, PrincipalKind};
use crate::error::{AsyncGateError, Result};

use super::models::{LeaseRow, ProgressRow, ReceiptRow, ReceiptType, RelationshipRow, TaskRow, TaskStatus};

// ============================================================================
// Tasks
// ============================================================================

/// Fields accepted by `create_task` (spec §4.3.1).
pub struct NewTask<'a> {
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    pub task_type: &'a str,
    pub payload: Value,
    pub created_by: &'a Principal,
    pub principal_ai: &'a str,
    pub requirements: Value,
    pub priority: i32,
    pub idempotency_key: Option<&'a str>,
    pub max_attempts: i32,
    pub retry_backoff_seconds: i32,
    pub delay_seconds: Option<i64>,
    pub expected_outcome_kind: Option<&'a str>,
    pub expected_artifact_mime: Option<&'a str>,
    pub owning_instance: &'a str,
    pub now: DateTime<Utc>,
}

/// Insert a task. On `(tenant_id, idempotency_key)` collision, re-fetches and
/// returns the existing row with `created = false` rather than surfacing the
/// constraint violation (spec §4.1 `create_task`, §7 "Idempotency collisions are
/// not errors").
pub async fn create_task(conn: &mut PgConnection, new: NewTask<'_>) -> Result<(TaskRow, bool)> {
    let next_eligible_at = new
        .delay_seconds
        .map(|secs| new.now + chrono::Duration::seconds(secs));

    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        INSERT INTO tasks (
            tenant_id, task_id, type, payload, created_by_kind, created_by_id,
            principal_ai, requirements, priority, status, attempt, max_attempts,
            retry_backoff_seconds, idempotency_key, expected_outcome_kind,
            expected_artifact_mime, payload_pointer, created_at, updated_at,
            next_eligible_at, asyncgate_instance
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', 0, $10, $11, $12, $13, $14,
            $15, $16, $16, $17, $18
        )
        ON CONFLICT (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL
        DO NOTHING
        RETURNING *
        "#,
    )
    .bind(new.tenant_id)
    .bind(new.task_id)
    .bind(new.task_type)
    .bind(&new.payload)
    .bind(new.created_by.kind)
    .bind(&new.created_by.id)
    .bind(new.principal_ai)
    .bind(&new.requirements)
    .bind(new.priority)
    .bind(new.max_attempts)
    .bind(new.retry_backoff_seconds)
    .bind(new.idempotency_key)
    .bind(new.expected_outcome_kind)
    .bind(new.expected_artifact_mime)
    .bind(format!("inline://task/{}", new.task_id))
    .bind(new.now)
    .bind(next_eligible_at)
    .bind(new.owning_instance)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = row {
        return Ok((row, true));
    }

    let key = new
        .idempotency_key
        .expect("ON CONFLICT target only fires when idempotency_key is set");
    let existing = get_task_by_idempotency_key(conn, new.tenant_id, key)
        .await?
        .ok_or_else(|| {
            AsyncGateError::Internal(anyhow::anyhow!(
                "create_task conflict on key {key} but no row found on re-fetch"
            ))
        })?;
    Ok((existing, false))
}

pub async fn get_task(conn: &mut PgConnection, tenant_id: TenantId, task_id: TaskId) -> Result<Option<TaskRow>> {
    let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE tenant_id = $1 AND task_id = $2")
        .bind(tenant_id)
        .bind(task_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn get_task_by_idempotency_key(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    key: &str,
) -> Result<Option<TaskRow>> {
    let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE tenant_id = $1 AND idempotency_key = $2")
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Filters accepted by `list_tasks` (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub created_by_id: Option<String>,
}

pub async fn list_tasks(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    filters: &TaskFilters,
    cursor: Option<DateTime<Utc>>,
    fetch_limit: i64,
) -> Result<Vec<TaskRow>> {
    let rows = sqlx::query_as::<_, TaskRow>(
        r#"
        SELECT * FROM tasks
        WHERE tenant_id = $1
          AND ($2::task_status IS NULL OR status = $2)
          AND ($3::text IS NULL OR type = $3)
          AND ($4::text IS NULL OR created_by_id = $4)
          AND ($5::timestamptz IS NULL OR created_at < $5)
        ORDER BY created_at DESC
        LIMIT $6
        "#,
    )
    .bind(tenant_id)
    .bind(filters.status)
    .bind(&filters.task_type)
    .bind(&filters.created_by_id)
    .bind(cursor)
    .bind(fetch_limit)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Terminal result fields written by `update_task_status` (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct TaskResultUpdate {
    pub outcome: Option<&'static str>,
    pub data: Option<Value>,
    pub error: Option<Value>,
    pub artifacts: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub async fn update_task_status(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    new_status: TaskStatus,
    result: TaskResultUpdate,
    now: DateTime<Utc>,
) -> Result<TaskRow> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        UPDATE tasks SET
            status = $3,
            result_outcome = COALESCE($4, result_outcome),
            result_data = COALESCE($5, result_data),
            result_error = COALESCE($6, result_error),
            result_artifacts = COALESCE($7, result_artifacts),
            completed_at = COALESCE($8, completed_at),
            updated_at = $9
        WHERE tenant_id = $1 AND task_id = $2
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(new_status)
    .bind(result.outcome)
    .bind(result.data)
    .bind(result.error)
    .bind(result.artifacts)
    .bind(result.completed_at)
    .bind(now)
    .fetch_optional(conn)
    .await?
    .ok_or(AsyncGateError::TaskNotFound)?;
    Ok(row)
}

pub async fn set_started_at(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    now: DateTime<Utc>,
) -> Result<TaskRow> {
    // Idempotent: only sets started_at the first time (spec §4.3.4 "repeat calls
    // keep the first started_at"), but always transitions leased -> running.
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        UPDATE tasks SET
            status = 'running',
            started_at = COALESCE(started_at, $3),
            updated_at = $3
        WHERE tenant_id = $1 AND task_id = $2
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(now)
    .fetch_optional(conn)
    .await?
    .ok_or(AsyncGateError::TaskNotFound)?;
    Ok(row)
}

/// `attempt++`, `next_eligible_at = now + min(base * 2^attempt, cap)`, status queued
/// (spec §4.1 `requeue_with_backoff`, used by `fail`'s retry path).
pub async fn requeue_with_backoff(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    max_backoff_seconds: i64,
    now: DateTime<Utc>,
) -> Result<TaskRow> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        UPDATE tasks SET
            status = 'queued',
            attempt = attempt + 1,
            started_at = NULL,
            next_eligible_at = $3 + make_interval(
                secs => LEAST(retry_backoff_seconds * power(2, attempt)::int, $4)
            ),
            updated_at = $3
        WHERE tenant_id = $1 AND task_id = $2
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(now)
    .bind(max_backoff_seconds as i32)
    .fetch_optional(conn)
    .await?
    .ok_or(AsyncGateError::TaskNotFound)?;
    Ok(row)
}

/// Terminal failure: status failed, result populated, `attempt` incremented to
/// record the attempt that was consumed by this failure (spec §8 scenario S3:
/// the attempt that exhausts `max_attempts` still counts).
pub async fn mark_failed_terminal(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    error: Value,
    now: DateTime<Utc>,
) -> Result<TaskRow> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        UPDATE tasks SET
            status = 'failed',
            attempt = attempt + 1,
            result_outcome = 'failed',
            result_error = $3,
            completed_at = $4,
            updated_at = $4
        WHERE tenant_id = $1 AND task_id = $2
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(error)
    .bind(now)
    .fetch_optional(conn)
    .await?
    .ok_or(AsyncGateError::TaskNotFound)?;
    Ok(row)
}

/// Lost-authority requeue: status queued, `next_eligible_at = now + jitter`,
/// `attempt` **unchanged**, `started_at` cleared (spec §4.1 `requeue_on_expiry`,
/// §8 invariant 2: lease expiry never consumes an attempt).
pub async fn requeue_on_expiry(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    jitter_seconds: f64,
    now: DateTime<Utc>,
) -> Result<TaskRow> {
    let next_eligible_at = now + chrono::Duration::milliseconds((jitter_seconds * 1000.0) as i64);
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        UPDATE tasks SET
            status = 'queued',
            started_at = NULL,
            next_eligible_at = $3,
            updated_at = $4
        WHERE tenant_id = $1 AND task_id = $2
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(next_eligible_at)
    .bind(now)
    .fetch_optional(conn)
    .await?
    .ok_or(AsyncGateError::TaskNotFound)?;
    Ok(row)
}

/// One claimed task with its freshly created lease.
pub struct Claimed {
    pub task: TaskRow,
    pub lease: LeaseRow,
}

/// A task's `requirements.capabilities` (if any) must be a subset of the claimer's
/// offered capabilities; a task with no capability requirement matches any worker.
/// Mirrors `original_source/db/repositories.py::LeaseRepository.claim_next`'s
/// post-lock subset check.
fn capabilities_satisfied(requirements: &Value, capabilities: &[String]) -> bool {
    let required: Vec<&str> = requirements
        .get("capabilities")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    required.iter().all(|r| capabilities.iter().any(|c| c == r))
}

/// Atomically claim up to `n` eligible tasks (spec §4.1 `claim_tasks`).
///
/// Caller must run this inside a transaction it commits itself (`conn` being
/// `&mut *tx`): the skip-locked candidate select, per-row lease insert, and status
/// flip must all be visible-or-not together.
pub async fn claim_tasks(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    worker_id: &str,
    capabilities: &[String],
    accept_types: Option<&[String]>,
    n: i64,
    ttl_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Claimed>> {
    if n <= 0 {
        return Ok(Vec::new());
    }
    let expires_at = now + chrono::Duration::seconds(ttl_seconds);

    // Over-fetch a generous multiple of `n`: capability filtering happens after the
    // lock is held, so some locked candidates may be skipped.
    let candidates = sqlx::query_as::<_, TaskRow>(
        r#"
        SELECT * FROM tasks
        WHERE tenant_id = $1
          AND status = 'queued'
          AND (next_eligible_at IS NULL OR next_eligible_at <= $2)
          AND ($3::text[] IS NULL OR type = ANY($3))
        ORDER BY priority DESC, created_at ASC
        LIMIT $4
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(tenant_id)
    .bind(now)
    .bind(accept_types)
    .bind(n * 4)
    .fetch_all(&mut *conn)
    .await?;

    let mut claimed = Vec::new();
    for task in candidates {
        if claimed.len() as i64 >= n {
            break;
        }
        if !capabilities_satisfied(&task.requirements, capabilities) {
            continue;
        }
        let lease_id = LeaseId::new();
        let lease = sqlx::query_as::<_, LeaseRow>(
            r#"
            INSERT INTO leases (lease_id, tenant_id, task_id, worker_id, expires_at,
                                 created_at, acquired_at, renewal_count)
            VALUES ($1, $2, $3, $4, $5, $6, $6, 0)
            RETURNING *
            "#,
        )
        .bind(lease_id)
        .bind(tenant_id)
        .bind(task.task_id)
        .bind(worker_id)
        .bind(expires_at)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        let task = sqlx::query_as::<_, TaskRow>(
            "UPDATE tasks SET status = 'leased', updated_at = $3 WHERE tenant_id = $1 AND task_id = $2 RETURNING *",
        )
        .bind(tenant_id)
        .bind(task.task_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        claimed.push(Claimed { task, lease });
    }
    Ok(claimed)
}

// ============================================================================
// Leases
// ============================================================================

pub async fn get_lease(conn: &mut PgConnection, tenant_id: TenantId, task_id: TaskId) -> Result<Option<LeaseRow>> {
    let row = sqlx::query_as::<_, LeaseRow>("SELECT * FROM leases WHERE tenant_id = $1 AND task_id = $2")
        .bind(tenant_id)
        .bind(task_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn validate_lease(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    lease_id: LeaseId,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<LeaseRow>> {
    let row = sqlx::query_as::<_, LeaseRow>(
        r#"
        SELECT * FROM leases
        WHERE tenant_id = $1 AND task_id = $2 AND lease_id = $3 AND worker_id = $4
          AND expires_at > $5
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(lease_id)
    .bind(worker_id)
    .bind(now)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

pub async fn renew_lease(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    lease_id: LeaseId,
    worker_id: &str,
    extend_by_seconds: i64,
    max_renewals: i32,
    max_lifetime_seconds: i64,
    now: DateTime<Utc>,
) -> Result<LeaseRow> {
    let current = sqlx::query_as::<_, LeaseRow>(
        "SELECT * FROM leases WHERE tenant_id = $1 AND task_id = $2 AND lease_id = $3 AND worker_id = $4 FOR UPDATE",
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(lease_id)
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(AsyncGateError::LeaseInvalidOrExpired)?;

    if current.expires_at <= now {
        return Err(AsyncGateError::LeaseInvalidOrExpired);
    }
    if current.renewal_count >= max_renewals {
        return Err(AsyncGateError::LeaseRenewalLimitExceeded {
            renewal_count: current.renewal_count,
            max: max_renewals,
        });
    }
    let lifetime_seconds = (now - current.acquired_at).num_seconds();
    if lifetime_seconds >= max_lifetime_seconds {
        return Err(AsyncGateError::LeaseLifetimeExceeded {
            lifetime_seconds,
            max: max_lifetime_seconds,
        });
    }

    let new_expires_at = now + chrono::Duration::seconds(extend_by_seconds);
    let row = sqlx::query_as::<_, LeaseRow>(
        r#"
        UPDATE leases SET expires_at = $5, renewal_count = renewal_count + 1
        WHERE tenant_id = $1 AND task_id = $2 AND lease_id = $3 AND worker_id = $4
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(lease_id)
    .bind(worker_id)
    .bind(new_expires_at)
    .fetch_optional(conn)
    .await?
    .ok_or(AsyncGateError::LeaseInvalidOrExpired)?;
    Ok(row)
}

pub async fn release_lease(conn: &mut PgConnection, tenant_id: TenantId, task_id: TaskId) -> Result<()> {
    sqlx::query("DELETE FROM leases WHERE tenant_id = $1 AND task_id = $2")
        .bind(tenant_id)
        .bind(task_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn get_expired_leases(
    conn: &mut PgConnection,
    instance_id: &str,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<LeaseRow>> {
    let rows = sqlx::query_as::<_, LeaseRow>(
        r#"
        SELECT l.* FROM leases l
        JOIN tasks t ON t.tenant_id = l.tenant_id AND t.task_id = l.task_id
        WHERE l.expires_at < $1 AND t.asyncgate_instance = $2
        ORDER BY l.expires_at ASC
        LIMIT $3
        "#,
    )
    .bind(now)
    .bind(instance_id)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

// ============================================================================
// Progress
// ============================================================================

pub async fn upsert_progress(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
    progress: Value,
    now: DateTime<Utc>,
) -> Result<ProgressRow> {
    let row = sqlx::query_as::<_, ProgressRow>(
        r#"
        INSERT INTO progress (tenant_id, task_id, progress, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (tenant_id, task_id) DO UPDATE SET progress = $3, updated_at = $4
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .bind(progress)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(row)
}

pub async fn get_progress(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
) -> Result<Option<ProgressRow>> {
    let row = sqlx::query_as::<_, ProgressRow>("SELECT * FROM progress WHERE tenant_id = $1 AND task_id = $2")
        .bind(tenant_id)
        .bind(task_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

// ============================================================================
// Relationships
// ============================================================================

pub async fn upsert_relationship(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    principal_kind: PrincipalKind,
    principal_id: &str,
    principal_instance_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<RelationshipRow> {
    let row = sqlx::query_as::<_, RelationshipRow>(
        r#"
        INSERT INTO relationships (
            tenant_id, principal_kind, principal_id, principal_instance_id,
            first_seen_at, last_seen_at, sessions_count
        )
        VALUES ($1, $2, $3, $4, $5, $5, 1)
        ON CONFLICT (tenant_id, principal_kind, principal_id) DO UPDATE SET
            last_seen_at = $5,
            principal_instance_id = COALESCE($4, relationships.principal_instance_id),
            sessions_count = relationships.sessions_count + 1
        RETURNING *
        "#,
    )
    .bind(tenant_id)
    .bind(principal_kind)
    .bind(principal_id)
    .bind(principal_instance_id)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(row)
}

// ============================================================================
// Receipts
// ============================================================================

/// Fields accepted by `insert_receipt` (spec §4.2.1).
pub struct NewReceipt<'a> {
    pub tenant_id: TenantId,
    pub receipt_id: ReceiptId,
    pub receipt_type: ReceiptType,
    pub from: &'a Principal,
    pub to: &'a Principal,
    pub task_id: Option<TaskId>,
    pub lease_id: Option<LeaseId>,
    pub schedule_id: Option<&'a str>,
    pub parents: &'a [Uuid],
    pub body: &'a Value,
    pub hash: &'a str,
    pub owning_instance: &'a str,
    pub now: DateTime<Utc>,
}

/// Insert a receipt. On `(tenant_id, hash)` collision, the `DO UPDATE SET hash =
/// EXCLUDED.hash` is a no-op write that still lets `RETURNING` hand back the
/// pre-existing row in one round trip (spec §4.2.1 step 6: idempotent emission).
pub async fn insert_receipt(conn: &mut PgConnection, new: NewReceipt<'_>) -> Result<ReceiptRow> {
    let parents_json = Value::Array(new.parents.iter().map(|p| Value::String(p.to_string())).collect());
    let row = sqlx::query_as::<_, ReceiptRow>(
        r#"
        INSERT INTO receipts (
            tenant_id, receipt_id, receipt_type, created_at, from_kind, from_id,
            to_kind, to_id, task_id, lease_id, schedule_id, parents, body, hash,
            asyncgate_instance
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (tenant_id, hash) DO UPDATE SET hash = EXCLUDED.hash
        RETURNING *
        "#,
    )
    .bind(new.tenant_id)
    .bind(new.receipt_id)
    .bind(new.receipt_type)
    .bind(new.now)
    .bind(new.from.kind)
    .bind(&new.from.id)
    .bind(new.to.kind)
    .bind(&new.to.id)
    .bind(new.task_id)
    .bind(new.lease_id)
    .bind(new.schedule_id)
    .bind(parents_json)
    .bind(new.body)
    .bind(new.hash)
    .bind(new.owning_instance)
    .fetch_one(conn)
    .await?;
    Ok(row)
}

pub async fn get_receipt(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    receipt_id: ReceiptId,
) -> Result<Option<ReceiptRow>> {
    let row = sqlx::query_as::<_, ReceiptRow>("SELECT * FROM receipts WHERE tenant_id = $1 AND receipt_id = $2")
        .bind(tenant_id)
        .bind(receipt_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn receipt_exists(conn: &mut PgConnection, tenant_id: TenantId, receipt_id: Uuid) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM receipts WHERE tenant_id = $1 AND receipt_id = $2)",
    )
    .bind(tenant_id)
    .bind(receipt_id)
    .fetch_one(conn)
    .await?;
    Ok(exists)
}

/// Find the `task.assigned` receipt for a task — the obligation-owner anchor every
/// downstream receipt cites (spec §9).
pub async fn get_task_assigned_receipt(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    task_id: TaskId,
) -> Result<Option<ReceiptRow>> {
    let row = sqlx::query_as::<_, ReceiptRow>(
        r#"
        SELECT * FROM receipts
        WHERE tenant_id = $1 AND task_id = $2 AND receipt_type = 'task.assigned'
        ORDER BY created_at ASC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

pub async fn list_receipts(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    to_kind: PrincipalKind,
    to_id: &str,
    since_created_at: Option<DateTime<Utc>>,
    fetch_limit: i64,
) -> Result<Vec<ReceiptRow>> {
    let rows = sqlx::query_as::<_, ReceiptRow>(
        r#"
        SELECT * FROM receipts
        WHERE tenant_id = $1 AND to_kind = $2 AND to_id = $3
          AND ($4::timestamptz IS NULL OR created_at > $4)
        ORDER BY created_at ASC
        LIMIT $5
        "#,
    )
    .bind(tenant_id)
    .bind(to_kind)
    .bind(to_id)
    .bind(since_created_at)
    .bind(fetch_limit)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn mark_delivered(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    receipt_ids: &[Uuid],
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE receipts SET delivered_at = $3
        WHERE tenant_id = $1 AND receipt_id = ANY($2) AND delivered_at IS NULL
        "#,
    )
    .bind(tenant_id)
    .bind(receipt_ids)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Existence-only check, O(1) via the GIN index on `parents` (spec §4.2.4).
///
/// `terminator_types` restricts the citing receipt to a registered terminator type —
/// a non-terminator receipt (e.g. `task.accepted`, `lease.expired`) may cite
/// `parent_id` for provenance without terminating its obligation.
pub async fn has_terminator(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    parent_id: Uuid,
    terminator_types: &[ReceiptType],
) -> Result<bool> {
    if terminator_types.is_empty() {
        return Ok(false);
    }
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM receipts
            WHERE tenant_id = $1 AND parents @> to_jsonb(ARRAY[$2::text]) AND receipt_type = ANY($3)
        )
        "#,
    )
    .bind(tenant_id)
    .bind(parent_id.to_string())
    .bind(terminator_types)
    .fetch_one(conn)
    .await?;
    Ok(exists)
}

pub async fn get_terminators(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    parent_id: Uuid,
    terminator_types: &[ReceiptType],
    limit: i64,
) -> Result<Vec<ReceiptRow>> {
    if terminator_types.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, ReceiptRow>(
        r#"
        SELECT * FROM receipts
        WHERE tenant_id = $1 AND parents @> to_jsonb(ARRAY[$2::text]) AND receipt_type = ANY($3)
        ORDER BY created_at ASC
        LIMIT $4
        "#,
    )
    .bind(tenant_id)
    .bind(parent_id.to_string())
    .bind(terminator_types)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn latest_terminator(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    parent_id: Uuid,
    terminator_types: &[ReceiptType],
) -> Result<Option<ReceiptRow>> {
    if terminator_types.is_empty() {
        return Ok(None);
    }
    let row = sqlx::query_as::<_, ReceiptRow>(
        r#"
        SELECT * FROM receipts
        WHERE tenant_id = $1 AND parents @> to_jsonb(ARRAY[$2::text]) AND receipt_type = ANY($3)
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(parent_id.to_string())
    .bind(terminator_types)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// The open-obligations query (spec §4.2.3): two queries regardless of page size.
///
/// Query 1 fetches candidate obligation receipts; query 2 is a single batch
/// containment check — `parents ?| candidate_ids` uses the GIN index to narrow to
/// "cited as a parent by *some* receipt" in one shot, then `receipt_type = ANY($3)`
/// restricts the citing receipt to a registered terminator type, rather than loading
/// every parents array tenant-wide and filtering in application code (see
/// `SPEC_FULL.md` §4.2.3 / `DESIGN.md`). Without that type filter, any receipt citing
/// a candidate as provenance (`task.accepted`, `task.started`, `lease.expired`, ...)
/// would be mistaken for a terminator.
pub async fn list_open_obligations(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    to_kind: PrincipalKind,
    to_id: &str,
    obligation_types: &[ReceiptType],
    terminator_types: &[ReceiptType],
    since_created_at: Option<DateTime<Utc>>,
    candidate_limit: i64,
) -> Result<Vec<ReceiptRow>> {
    if obligation_types.is_empty() {
        return Ok(Vec::new());
    }

    let candidates = sqlx::query_as::<_, ReceiptRow>(
        r#"
        SELECT * FROM receipts
        WHERE tenant_id = $1 AND to_kind = $2 AND to_id = $3
          AND receipt_type = ANY($4)
          AND ($5::timestamptz IS NULL OR created_at > $5)
        ORDER BY created_at ASC
        LIMIT $6
        "#,
    )
    .bind(tenant_id)
    .bind(to_kind)
    .bind(to_id)
    .bind(obligation_types)
    .bind(since_created_at)
    .bind(candidate_limit)
    .fetch_all(&mut *conn)
    .await?;

    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    if terminator_types.is_empty() {
        return Ok(candidates);
    }

    let candidate_ids: Vec<String> = candidates.iter().map(|r| r.receipt_id.to_string()).collect();

    // Single batch existence query over the whole candidate set: one index probe, not
    // one query per candidate. `receipt_type = ANY($3)` is what makes this a
    // terminator check rather than a plain citation check.
    let terminated: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT parent
        FROM receipts, jsonb_array_elements_text(parents) AS parent
        WHERE tenant_id = $1 AND parents ?| $2 AND receipt_type = ANY($3)
        "#,
    )
    .bind(tenant_id)
    .bind(&candidate_ids)
    .bind(terminator_types)
    .fetch_all(&mut *conn)
    .await?;

    let terminated: std::collections::HashSet<String> = terminated.into_iter().collect();

    Ok(candidates
        .into_iter()
        .filter(|r| !terminated.contains(&r.receipt_id.to_string()))
        .collect())
}
