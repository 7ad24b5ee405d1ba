//! Task Engine (spec §4.3): the state machine for tasks and leases.
//!
//! Every operation that changes task state and writes a receipt does both inside
//! one transaction (a savepoint when the caller is already inside one), so a task
//! is never left in a new state without its terminator, following the teacher's
//! `kernel/jobs`'s claim-then-act transactional style. Obligation-owner
//! resolution (spec §9) is load-bearing: every receipt past `task.assigned` is
//! addressed to the `to` principal recorded on that task's `task.assigned`
//! receipt, re-fetched fresh on every call rather than re-derived from
//! `created_by`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::common::entity_ids::{LeaseId, TaskId, TenantId};
use crate::common::principal::{is_internal_principal_id, normalize_principal_id, Principal, PrincipalKind, SYSTEM_PRINCIPAL_ID};
use crate::config::Config;
use crate::contracts::{Clock, IdGen};
use crate::error::{AsyncGateError, Result};
use crate::ledger::{EmitInput, EmitOutcome, ReceiptLedger};
use crate::storage::models::{LeaseRow, ProgressRow, ReceiptRow, ReceiptType, TaskRow, TaskStatus};
use crate::storage::{queries, NewTask, Store, TaskFilters, TaskResultUpdate};

/// Up to this many tasks may be claimed in one `claim_tasks` call (spec §4.1).
pub const MAX_CLAIM_BATCH: i64 = 10;

/// Inputs to `create_task` (spec §4.3.1).
pub struct CreateTaskInput<'a> {
    pub tenant_id: TenantId,
    pub task_type: &'a str,
    pub payload: Value,
    pub created_by: &'a Principal,
    pub caller_is_internal: bool,
    pub principal_ai: &'a str,
    pub requirements: Option<Value>,
    pub priority: Option<i32>,
    pub idempotency_key: Option<&'a str>,
    pub max_attempts: Option<i32>,
    pub retry_backoff_seconds: Option<i32>,
    pub delay_seconds: Option<i64>,
    pub expected_outcome_kind: Option<&'a str>,
    pub expected_artifact_mime: Option<&'a str>,
}

/// Result of `create_task`: the id, the (possibly pre-existing) status, and
/// whether this call is the one that actually created the row.
#[derive(Debug, Clone)]
pub struct CreateTaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub created: bool,
}

/// Inputs to `claim_tasks` (spec §4.3.2, "lease_next").
pub struct ClaimTasksInput<'a> {
    pub tenant_id: TenantId,
    pub worker_id: &'a str,
    pub capabilities: Vec<String>,
    pub accept_types: Option<Vec<String>>,
    pub max_tasks: i64,
    pub lease_ttl_seconds: Option<i64>,
}

/// One claimed lease, carrying everything a worker needs to start work.
#[derive(Debug, Clone)]
pub struct ClaimedLease {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub task_type: String,
    pub payload: Value,
    pub payload_pointer: Option<String>,
    pub principal_ai: Option<String>,
    pub attempt: i32,
    pub expires_at: DateTime<Utc>,
    pub requirements: Value,
    pub expected_outcome_kind: Option<String>,
    pub expected_artifact_mime: Option<String>,
}

/// Inputs to `complete` (spec §4.3.5).
pub struct CompleteInput<'a> {
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub worker_id: &'a str,
    pub result_summary: Value,
    pub result_payload: Option<Value>,
    pub artifacts: Option<Value>,
    pub delivery_proof: Option<Value>,
    pub metadata: Option<Value>,
}

/// Inputs to `fail` (spec §4.3.6).
pub struct FailInput<'a> {
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub worker_id: &'a str,
    pub retryable: bool,
    pub error: Value,
}

/// `{ok, requeued, next_eligible_at}` from spec §4.3.6.
#[derive(Debug, Clone)]
pub struct FailOutcome {
    pub task: TaskRow,
    pub requeued: bool,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

/// Inputs to `cancel_task` (spec §4.3.7).
pub struct CancelTaskInput<'a> {
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    pub caller: &'a Principal,
    pub caller_is_internal: bool,
    pub reason: Option<Value>,
}

/// The deprecated bucketing view (spec §9): buckets are always empty. Kept only
/// for transitional API compatibility; `list_open_obligations` is the real query.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOutcome {
    pub buckets: Vec<Value>,
}

/// The state machine for tasks and leases: the nine public operations of spec
/// §4.3, plus the thin read paths (`get_task`, `list_tasks`, `list_receipts`,
/// `list_open_obligations`) that round out the TASKER/TASKEE surface of §4.6.
#[derive(Clone)]
pub struct TaskEngine {
    store: Store,
    ledger: ReceiptLedger,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    idgen: Arc<dyn IdGen>,
    instance_id: Arc<str>,
}

impl TaskEngine {
    pub fn new(
        store: Store,
        ledger: ReceiptLedger,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        idgen: Arc<dyn IdGen>,
        instance_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            clock,
            idgen,
            instance_id: instance_id.into(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The normalized obligation owner for a newly created task: the creator,
    /// unless the creator is the canonical system id, in which case the owner is
    /// the canonical system principal (spec §4.3.1, §3 "Principal kinds").
    fn resolve_owner(created_by: &Principal) -> Principal {
        let normalized_id = normalize_principal_id(&created_by.id);
        if normalized_id == SYSTEM_PRINCIPAL_ID {
            Principal::system()
        } else {
            Principal::new(created_by.kind, normalized_id)
        }
    }

    // ------------------------------------------------------------------
    // 4.3.1 create_task
    // ------------------------------------------------------------------

    pub async fn create_task(&self, input: CreateTaskInput<'_>) -> Result<CreateTaskOutcome> {
        if is_internal_principal_id(&input.created_by.id) && !input.caller_is_internal {
            return Err(AsyncGateError::Unauthorized);
        }

        let now = self.clock.now();
        let task_id = self.idgen.task_id();
        let owner = Self::resolve_owner(input.created_by);
        let requirements = input.requirements.unwrap_or_else(|| serde_json::json!({}));

        let mut tx = self.store.begin().await?;
        let (task, created) = queries::create_task(
            &mut tx,
            NewTask {
                tenant_id: input.tenant_id,
                task_id,
                task_type: input.task_type,
                payload: input.payload,
                created_by: input.created_by,
                principal_ai: input.principal_ai,
                requirements: requirements.clone(),
                priority: input.priority.unwrap_or(0),
                idempotency_key: input.idempotency_key,
                max_attempts: input.max_attempts.unwrap_or(self.config.default_max_attempts),
                retry_backoff_seconds: input
                    .retry_backoff_seconds
                    .unwrap_or(self.config.default_retry_backoff.as_secs() as i32),
                delay_seconds: input.delay_seconds,
                expected_outcome_kind: input.expected_outcome_kind,
                expected_artifact_mime: input.expected_artifact_mime,
                owning_instance: &self.instance_id,
                now,
            },
        )
        .await?;

        if created {
            let body = serde_json::json!({
                "instructions": task.payload,
                "requirements": requirements,
                "success_criteria": Value::Null,
                "result_delivery": Value::Null,
                "timeouts": {
                    "lease_ttl_seconds": self.config.lease_ttl.as_secs(),
                    "max_lease_ttl_seconds": self.config.max_lease_ttl.as_secs(),
                },
            });
            self.ledger
                .emit(
                    &mut tx,
                    input.tenant_id,
                    EmitInput {
                        receipt_type: ReceiptType::TaskAssigned,
                        from: &Principal::service(),
                        to: &owner,
                        task_id: Some(task_id),
                        lease_id: None,
                        schedule_id: None,
                        parents: &[],
                        body,
                        owning_instance: &self.instance_id,
                    },
                    now,
                )
                .await?;
        }
        tx.commit().await?;

        Ok(CreateTaskOutcome {
            task_id: task.task_id,
            status: task.status,
            created,
        })
    }

    // ------------------------------------------------------------------
    // 4.3.2 claim_tasks (lease_next)
    // ------------------------------------------------------------------

    pub async fn claim_tasks(&self, input: ClaimTasksInput<'_>) -> Result<Vec<ClaimedLease>> {
        let now = self.clock.now();
        let n = input.max_tasks.clamp(0, MAX_CLAIM_BATCH);
        if n == 0 {
            return Ok(Vec::new());
        }
        let ttl_seconds = input
            .lease_ttl_seconds
            .unwrap_or(self.config.lease_ttl.as_secs() as i64)
            .min(self.config.max_lease_ttl.as_secs() as i64);

        let claimed = self
            .store
            .claim_tasks(
                input.tenant_id,
                input.worker_id,
                &input.capabilities,
                input.accept_types.as_deref(),
                n,
                ttl_seconds,
                now,
            )
            .await?;

        let worker = Principal::new(PrincipalKind::Worker, input.worker_id);
        let mut out = Vec::with_capacity(claimed.len());
        for claim in claimed {
            let mut conn = self.store.pool().acquire().await?;
            let assigned = queries::get_task_assigned_receipt(&mut conn, input.tenant_id, claim.task.task_id)
                .await?
                .ok_or_else(|| {
                    AsyncGateError::Internal(anyhow::anyhow!(
                        "task {} has no task.assigned receipt to accept against",
                        claim.task.task_id
                    ))
                })?;
            let owner = assigned.to_principal();
            self.ledger
                .emit(
                    &mut conn,
                    input.tenant_id,
                    EmitInput {
                        receipt_type: ReceiptType::TaskAccepted,
                        from: &worker,
                        to: &owner,
                        task_id: Some(claim.task.task_id),
                        lease_id: Some(claim.lease.lease_id),
                        schedule_id: None,
                        parents: &[assigned.receipt_id.into()],
                        body: serde_json::json!({}),
                        owning_instance: &self.instance_id,
                    },
                    now,
                )
                .await?;

            out.push(ClaimedLease {
                task_id: claim.task.task_id,
                lease_id: claim.lease.lease_id,
                task_type: claim.task.task_type,
                payload: claim.task.payload,
                payload_pointer: claim.task.payload_pointer,
                principal_ai: claim.task.principal_ai,
                attempt: claim.task.attempt,
                expires_at: claim.lease.expires_at,
                requirements: claim.task.requirements,
                expected_outcome_kind: claim.task.expected_outcome_kind,
                expected_artifact_mime: claim.task.expected_artifact_mime,
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // 4.3.3 renew_lease
    // ------------------------------------------------------------------

    pub async fn renew_lease(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        lease_id: LeaseId,
        worker_id: &str,
        extend_by_seconds: Option<i64>,
    ) -> Result<LeaseRow> {
        let now = self.clock.now();
        let task = self
            .store
            .get_task(tenant_id, task_id)
            .await?
            .ok_or(AsyncGateError::TaskNotFound)?;
        if !matches!(task.status, TaskStatus::Leased | TaskStatus::Running) {
            return Err(AsyncGateError::LeaseInvalidOrExpired);
        }
        let extend_by = extend_by_seconds
            .unwrap_or(self.config.lease_ttl.as_secs() as i64)
            .min(self.config.max_lease_ttl.as_secs() as i64);

        self.store
            .renew_lease(
                tenant_id,
                task_id,
                lease_id,
                worker_id,
                extend_by,
                self.config.max_renewals,
                self.config.max_lease_lifetime.as_secs() as i64,
                now,
            )
            .await
    }

    // ------------------------------------------------------------------
    // 4.3.4 report_progress / start_task
    // ------------------------------------------------------------------

    /// Shared leased->running transition: idempotent, only fires `task.started`
    /// the first time a lease's holder calls `start_task`/`report_progress`.
    async fn ensure_started(
        &self,
        conn: &mut sqlx::PgConnection,
        tenant_id: TenantId,
        task_id: TaskId,
        lease_id: LeaseId,
        worker: &Principal,
        now: DateTime<Utc>,
    ) -> Result<TaskRow> {
        let current = queries::get_task(conn, tenant_id, task_id)
            .await?
            .ok_or(AsyncGateError::TaskNotFound)?;

        let task = match current.status {
            TaskStatus::Leased => queries::set_started_at(conn, tenant_id, task_id, now).await?,
            TaskStatus::Running => current,
            other => {
                return Err(AsyncGateError::InvalidStateTransition {
                    current: format!("{other:?}").to_lowercase(),
                    requested: "running".to_string(),
                })
            }
        };

        if current.status == TaskStatus::Leased {
            let assigned = queries::get_task_assigned_receipt(conn, tenant_id, task_id)
                .await?
                .ok_or_else(|| AsyncGateError::Internal(anyhow::anyhow!("task {task_id} has no task.assigned receipt")))?;
            let owner = assigned.to_principal();
            self.ledger
                .emit(
                    conn,
                    tenant_id,
                    EmitInput {
                        receipt_type: ReceiptType::TaskStarted,
                        from: worker,
                        to: &owner,
                        task_id: Some(task_id),
                        lease_id: Some(lease_id),
                        schedule_id: None,
                        parents: &[assigned.receipt_id.into()],
                        body: serde_json::json!({}),
                        owning_instance: &self.instance_id,
                    },
                    now,
                )
                .await?;
        }

        Ok(task)
    }

    pub async fn start_task(&self, tenant_id: TenantId, task_id: TaskId, lease_id: LeaseId, worker_id: &str) -> Result<TaskRow> {
        let now = self.clock.now();
        let lease = self
            .store
            .validate_lease(tenant_id, task_id, lease_id, worker_id, now)
            .await?
            .ok_or(AsyncGateError::LeaseInvalidOrExpired)?;
        let worker = Principal::new(PrincipalKind::Worker, worker_id);

        let mut tx = self.store.begin().await?;
        let task = self
            .ensure_started(&mut tx, tenant_id, task_id, lease.lease_id, &worker, now)
            .await?;
        tx.commit().await?;
        Ok(task)
    }

    pub async fn report_progress(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        lease_id: LeaseId,
        worker_id: &str,
        progress: Value,
    ) -> Result<ProgressRow> {
        let now = self.clock.now();
        let lease = self
            .store
            .validate_lease(tenant_id, task_id, lease_id, worker_id, now)
            .await?
            .ok_or(AsyncGateError::LeaseInvalidOrExpired)?;
        let worker = Principal::new(PrincipalKind::Worker, worker_id);

        let mut tx = self.store.begin().await?;
        self.ensure_started(&mut tx, tenant_id, task_id, lease.lease_id, &worker, now)
            .await?;
        let row = queries::upsert_progress(&mut tx, tenant_id, task_id, progress.clone(), now).await?;

        let assigned = queries::get_task_assigned_receipt(&mut tx, tenant_id, task_id)
            .await?
            .ok_or_else(|| AsyncGateError::Internal(anyhow::anyhow!("task {task_id} has no task.assigned receipt")))?;
        let owner = assigned.to_principal();
        self.ledger
            .emit(
                &mut tx,
                tenant_id,
                EmitInput {
                    receipt_type: ReceiptType::TaskProgress,
                    from: &worker,
                    to: &owner,
                    task_id: Some(task_id),
                    lease_id: Some(lease_id),
                    schedule_id: None,
                    parents: &[assigned.receipt_id.into()],
                    body: progress,
                    owning_instance: &self.instance_id,
                },
                now,
            )
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // 4.3.5 complete
    // ------------------------------------------------------------------

    pub async fn complete(&self, input: CompleteInput<'_>) -> Result<(TaskRow, EmitOutcome)> {
        let now = self.clock.now();
        self.store
            .validate_lease(input.tenant_id, input.task_id, input.lease_id, input.worker_id, now)
            .await?
            .ok_or(AsyncGateError::LeaseInvalidOrExpired)?;
        let worker = Principal::new(PrincipalKind::Worker, input.worker_id);

        let mut tx = self.store.begin().await?;
        let before = queries::get_task(&mut tx, input.tenant_id, input.task_id)
            .await?
            .ok_or(AsyncGateError::TaskNotFound)?;
        if !matches!(before.status, TaskStatus::Leased | TaskStatus::Running) {
            return Err(AsyncGateError::InvalidStateTransition {
                current: format!("{:?}", before.status).to_lowercase(),
                requested: "succeeded".to_string(),
            });
        }

        let mut body = serde_json::json!({ "result_summary": input.result_summary });
        if let Some(payload) = &input.result_payload {
            body["result_payload"] = payload.clone();
        }
        if let Some(artifacts) = &input.artifacts {
            body["artifacts"] = artifacts.clone();
        }
        if let Some(proof) = &input.delivery_proof {
            body["delivery_proof"] = proof.clone();
        }
        if let Some(metadata) = &input.metadata {
            body["completion_metadata"] = metadata.clone();
        }

        let task = queries::update_task_status(
            &mut tx,
            input.tenant_id,
            input.task_id,
            TaskStatus::Succeeded,
            TaskResultUpdate {
                outcome: Some("succeeded"),
                data: input.result_payload.clone(),
                error: None,
                artifacts: input.artifacts.clone(),
                completed_at: Some(now),
            },
            now,
        )
        .await?;
        queries::release_lease(&mut tx, input.tenant_id, input.task_id).await?;

        let assigned = queries::get_task_assigned_receipt(&mut tx, input.tenant_id, input.task_id)
            .await?
            .ok_or_else(|| AsyncGateError::Internal(anyhow::anyhow!("task {} has no task.assigned receipt", input.task_id)))?;
        let owner = assigned.to_principal();

        let completed = self
            .ledger
            .emit(
                &mut tx,
                input.tenant_id,
                EmitInput {
                    receipt_type: ReceiptType::TaskCompleted,
                    from: &worker,
                    to: &owner,
                    task_id: Some(input.task_id),
                    lease_id: Some(input.lease_id),
                    schedule_id: None,
                    parents: &[assigned.receipt_id.into()],
                    body,
                    owning_instance: &self.instance_id,
                },
                now,
            )
            .await?;

        self.ledger
            .emit(
                &mut tx,
                input.tenant_id,
                EmitInput {
                    receipt_type: ReceiptType::TaskResultReady,
                    from: &Principal::service(),
                    to: &owner,
                    task_id: Some(input.task_id),
                    lease_id: None,
                    schedule_id: None,
                    parents: &[assigned.receipt_id.into()],
                    body: serde_json::json!({ "status": "succeeded" }),
                    owning_instance: &self.instance_id,
                },
                now,
            )
            .await?;

        tx.commit().await?;
        Ok((task, completed))
    }

    // ------------------------------------------------------------------
    // 4.3.6 fail
    // ------------------------------------------------------------------

    pub async fn fail(&self, input: FailInput<'_>) -> Result<FailOutcome> {
        let now = self.clock.now();
        self.store
            .validate_lease(input.tenant_id, input.task_id, input.lease_id, input.worker_id, now)
            .await?
            .ok_or(AsyncGateError::LeaseInvalidOrExpired)?;
        let worker = Principal::new(PrincipalKind::Worker, input.worker_id);

        let mut tx = self.store.begin().await?;
        let before = queries::get_task(&mut tx, input.tenant_id, input.task_id)
            .await?
            .ok_or(AsyncGateError::TaskNotFound)?;
        if !matches!(before.status, TaskStatus::Leased | TaskStatus::Running) {
            return Err(AsyncGateError::InvalidStateTransition {
                current: format!("{:?}", before.status).to_lowercase(),
                requested: "failed".to_string(),
            });
        }

        let requeue = input.retryable && before.attempt + 1 < before.max_attempts;

        let assigned = queries::get_task_assigned_receipt(&mut tx, input.tenant_id, input.task_id)
            .await?
            .ok_or_else(|| AsyncGateError::Internal(anyhow::anyhow!("task {} has no task.assigned receipt", input.task_id)))?;
        let owner = assigned.to_principal();

        queries::release_lease(&mut tx, input.tenant_id, input.task_id).await?;

        let (task, next_eligible_at) = if requeue {
            let task = queries::requeue_with_backoff(
                &mut tx,
                input.tenant_id,
                input.task_id,
                self.config.max_retry_backoff.as_secs() as i64,
                now,
            )
            .await?;
            self.ledger
                .emit(
                    &mut tx,
                    input.tenant_id,
                    EmitInput {
                        receipt_type: ReceiptType::TaskRetryScheduled,
                        from: &worker,
                        to: &owner,
                        task_id: Some(input.task_id),
                        lease_id: Some(input.lease_id),
                        schedule_id: None,
                        parents: &[assigned.receipt_id.into()],
                        body: serde_json::json!({
                            "error": input.error,
                            "attempt": task.attempt,
                            "next_eligible_at": task.next_eligible_at,
                        }),
                        owning_instance: &self.instance_id,
                    },
                    now,
                )
                .await?;
            let next_eligible_at = task.next_eligible_at;
            (task, next_eligible_at)
        } else {
            let task = queries::mark_failed_terminal(&mut tx, input.tenant_id, input.task_id, input.error.clone(), now).await?;
            self.ledger
                .emit(
                    &mut tx,
                    input.tenant_id,
                    EmitInput {
                        receipt_type: ReceiptType::TaskFailed,
                        from: &worker,
                        to: &owner,
                        task_id: Some(input.task_id),
                        lease_id: Some(input.lease_id),
                        schedule_id: None,
                        parents: &[assigned.receipt_id.into()],
                        body: serde_json::json!({ "error": input.error }),
                        owning_instance: &self.instance_id,
                    },
                    now,
                )
                .await?;
            self.ledger
                .emit(
                    &mut tx,
                    input.tenant_id,
                    EmitInput {
                        receipt_type: ReceiptType::TaskResultReady,
                        from: &Principal::service(),
                        to: &owner,
                        task_id: Some(input.task_id),
                        lease_id: None,
                        schedule_id: None,
                        parents: &[assigned.receipt_id.into()],
                        body: serde_json::json!({ "status": "failed" }),
                        owning_instance: &self.instance_id,
                    },
                    now,
                )
                .await?;
            (task, None)
        };

        tx.commit().await?;
        Ok(FailOutcome {
            task,
            requeued: requeue,
            next_eligible_at,
        })
    }

    // ------------------------------------------------------------------
    // 4.3.7 cancel_task
    // ------------------------------------------------------------------

    pub async fn cancel_task(&self, input: CancelTaskInput<'_>) -> Result<TaskRow> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let task = queries::get_task(&mut tx, input.tenant_id, input.task_id)
            .await?
            .ok_or(AsyncGateError::TaskNotFound)?;
        if task.is_terminal() {
            return Ok(task);
        }

        let assigned = queries::get_task_assigned_receipt(&mut tx, input.tenant_id, input.task_id)
            .await?
            .ok_or_else(|| AsyncGateError::Internal(anyhow::anyhow!("task {} has no task.assigned receipt", input.task_id)))?;
        let owner = assigned.to_principal();

        let authorized = input.caller_is_internal || (*input.caller == owner);
        if !authorized {
            return Err(AsyncGateError::Unauthorized);
        }

        queries::release_lease(&mut tx, input.tenant_id, input.task_id).await?;
        let task = queries::update_task_status(
            &mut tx,
            input.tenant_id,
            input.task_id,
            TaskStatus::Canceled,
            TaskResultUpdate {
                outcome: Some("canceled"),
                data: None,
                error: input.reason.clone(),
                artifacts: None,
                completed_at: Some(now),
            },
            now,
        )
        .await?;

        self.ledger
            .emit(
                &mut tx,
                input.tenant_id,
                EmitInput {
                    receipt_type: ReceiptType::TaskCanceled,
                    from: input.caller,
                    to: &owner,
                    task_id: Some(input.task_id),
                    lease_id: None,
                    schedule_id: None,
                    parents: &[assigned.receipt_id.into()],
                    body: serde_json::json!({ "reason": input.reason }),
                    owning_instance: &self.instance_id,
                },
                now,
            )
            .await?;

        self.ledger
            .emit(
                &mut tx,
                input.tenant_id,
                EmitInput {
                    receipt_type: ReceiptType::TaskResultReady,
                    from: &Principal::service(),
                    to: &owner,
                    task_id: Some(input.task_id),
                    lease_id: None,
                    schedule_id: None,
                    parents: &[assigned.receipt_id.into()],
                    body: serde_json::json!({ "status": "canceled" }),
                    owning_instance: &self.instance_id,
                },
                now,
            )
            .await?;

        tx.commit().await?;
        Ok(task)
    }

    // ------------------------------------------------------------------
    // 4.3.8 ack_receipt
    // ------------------------------------------------------------------

    /// Acks are events, not flags: acknowledging the same receipt twice produces
    /// two distinct `receipt.acknowledged` rows (spec §8 round-trip law), so the
    /// body carries the acknowledgement instant to keep the two calls' hashes apart.
    pub async fn ack_receipt(&self, tenant_id: TenantId, receipt_id: Uuid, principal: &Principal) -> Result<ReceiptRow> {
        let now = self.clock.now();
        let mut conn = self.store.pool().acquire().await?;
        let outcome = self
            .ledger
            .emit(
                &mut conn,
                tenant_id,
                EmitInput {
                    receipt_type: ReceiptType::ReceiptAcknowledged,
                    from: principal,
                    to: &Principal::service(),
                    task_id: None,
                    lease_id: None,
                    schedule_id: None,
                    parents: &[receipt_id],
                    body: serde_json::json!({ "acknowledged_at": now.to_rfc3339() }),
                    owning_instance: &self.instance_id,
                },
                now,
            )
            .await?;
        Ok(outcome.receipt)
    }

    // ------------------------------------------------------------------
    // Read paths (TASKER ops §4.6)
    // ------------------------------------------------------------------

    pub async fn get_task(&self, tenant_id: TenantId, task_id: TaskId) -> Result<Option<TaskRow>> {
        self.store.get_task(tenant_id, task_id).await
    }

    pub async fn list_tasks(
        &self,
        tenant_id: TenantId,
        filters: &TaskFilters,
        cursor: Option<DateTime<Utc>>,
        fetch_limit: i64,
    ) -> Result<Vec<TaskRow>> {
        self.store.list_tasks(tenant_id, filters, cursor, fetch_limit).await
    }

    pub async fn list_receipts(
        &self,
        tenant_id: TenantId,
        to: &Principal,
        since: Option<DateTime<Utc>>,
        fetch_limit: i64,
    ) -> Result<Vec<ReceiptRow>> {
        self.store.list_receipts(tenant_id, to.kind, &to.id, since, fetch_limit).await
    }

    /// Bootstrap primitive (spec §4.2.3 / glossary "Bootstrap"): the open
    /// obligations for a principal, the sole source of truth for outstanding work.
    pub async fn list_open_obligations(
        &self,
        tenant_id: TenantId,
        to: &Principal,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ReceiptRow>> {
        let mut conn = self.store.pool().acquire().await?;
        self.ledger
            .list_open_obligations(&mut conn, tenant_id, to.kind, &to.id, since, limit)
            .await
    }

    /// Deprecated bucketing view (spec §9): always empty. Retained only for
    /// transitional API compatibility; new code must use `list_open_obligations`.
    pub async fn bootstrap(&self, _tenant_id: TenantId, _principal: &Principal) -> Result<BootstrapOutcome> {
        Ok(BootstrapOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_owner_maps_system_alias_to_canonical_system_principal() {
        let creator = Principal::new(PrincipalKind::System, SYSTEM_PRINCIPAL_ID);
        let owner = TaskEngine::resolve_owner(&creator);
        assert!(owner.is_system());
    }

    #[test]
    fn resolve_owner_normalizes_external_agent_ids() {
        let creator = Principal::new(PrincipalKind::Agent, "ext:a1");
        let owner = TaskEngine::resolve_owner(&creator);
        assert_eq!(owner.id, "a1");
        assert_eq!(owner.kind, PrincipalKind::Agent);
    }
}
