//! Row types for tasks, leases, receipts, progress, and relationships (spec §3).
//!
//! These mirror the columns in `migrations/0001_initial_schema.sql` through
//! `0003_add_task_principal_ai_payload_pointer.sql` and are decoded with
//! `sqlx::FromRow`, following `kernel/jobs/job.rs`'s `Job` row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::entity_ids::{LeaseId, ReceiptId, TaskId, TenantId};
use crate::common::principal::PrincipalKind;

/// Task lifecycle status (spec §3, with `running` added by migration 0002).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled)
    }
}

/// Terminal outcome recorded on a task's `result_outcome` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    Canceled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Canceled => "canceled",
        }
    }
}

/// The closed set of receipt types (spec §6).
///
/// Stored as the Postgres enum `receipt_type`. `AsRef<str>`/`Display` give the wire
/// string used in hashing (`ledger::hash`) and HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "receipt_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    TaskAssigned,
    TaskAccepted,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskCanceled,
    TaskRetryScheduled,
    TaskResultReady,
    TaskEscalated,
    LeaseExpired,
    ReceiptAcknowledged,
    SystemAnomaly,
}

impl ReceiptType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptType::TaskAssigned => "task.assigned",
            ReceiptType::TaskAccepted => "task.accepted",
            ReceiptType::TaskStarted => "task.started",
            ReceiptType::TaskProgress => "task.progress",
            ReceiptType::TaskCompleted => "task.completed",
            ReceiptType::TaskFailed => "task.failed",
            ReceiptType::TaskCanceled => "task.canceled",
            ReceiptType::TaskRetryScheduled => "task.retry_scheduled",
            ReceiptType::TaskResultReady => "task.result_ready",
            ReceiptType::TaskEscalated => "task.escalated",
            ReceiptType::LeaseExpired => "lease.expired",
            ReceiptType::ReceiptAcknowledged => "receipt.acknowledged",
            ReceiptType::SystemAnomaly => "system.anomaly",
        }
    }
}

impl std::fmt::Display for ReceiptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work (spec §3 "Task").
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub created_by_kind: PrincipalKind,
    pub created_by_id: String,
    pub created_by_instance_id: Option<String>,
    pub principal_ai: Option<String>,
    pub payload_pointer: Option<String>,
    pub requirements: Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub retry_backoff_seconds: i32,
    pub idempotency_key: Option<String>,
    pub expected_outcome_kind: Option<String>,
    pub expected_artifact_mime: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub result_outcome: Option<String>,
    pub result_data: Option<Value>,
    pub result_error: Option<Value>,
    pub result_artifacts: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub asyncgate_instance: Option<String>,
}

impl TaskRow {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn created_by(&self) -> crate::common::principal::Principal {
        crate::common::principal::Principal::new(self.created_by_kind, self.created_by_id.clone())
    }
}

/// An exclusive, time-bounded claim on a task (spec §3 "Lease").
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRow {
    pub lease_id: LeaseId,
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
    pub renewal_count: i32,
}

/// An immutable ledger entry (spec §3 "Receipt").
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRow {
    pub tenant_id: TenantId,
    pub receipt_id: ReceiptId,
    pub receipt_type: ReceiptType,
    pub created_at: DateTime<Utc>,
    pub from_kind: PrincipalKind,
    pub from_id: String,
    pub to_kind: PrincipalKind,
    pub to_id: String,
    pub task_id: Option<TaskId>,
    pub lease_id: Option<LeaseId>,
    pub schedule_id: Option<String>,
    pub parents: Value,
    pub body: Value,
    pub hash: Option<String>,
    pub asyncgate_instance: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl ReceiptRow {
    /// Decode the `parents` jsonb array into typed ids.
    pub fn parent_ids(&self) -> Vec<Uuid> {
        self.parents
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| Uuid::parse_str(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn from_principal(&self) -> crate::common::principal::Principal {
        crate::common::principal::Principal::new(self.from_kind, self.from_id.clone())
    }

    pub fn to_principal(&self) -> crate::common::principal::Principal {
        crate::common::principal::Principal::new(self.to_kind, self.to_id.clone())
    }
}

/// Last-writer-wins progress blob for a task (spec §3 "Progress").
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRow {
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    pub progress: Value,
    pub updated_at: DateTime<Utc>,
}

/// First-seen/last-seen observation per principal (spec §3 "Relationship").
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipRow {
    pub tenant_id: TenantId,
    pub principal_kind: PrincipalKind,
    pub principal_id: String,
    pub principal_instance_id: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub sessions_count: i32,
}
