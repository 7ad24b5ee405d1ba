//! Receipt Ledger (spec §4.2): emission, termination rules, provenance helpers.

pub mod hash;
pub mod termination;

pub use crate::storage::models::ReceiptType;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgConnection;
use tracing::warn;
use uuid::Uuid;

use crate::common::entity_ids::{LeaseId, ReceiptId, TaskId, TenantId};
use crate::common::principal::{Principal, PrincipalKind};
use crate::error::{AsyncGateError, AnomalyAccepted, Result};
use crate::storage::models::ReceiptRow;
use crate::storage::queries;

use hash::{receipt_hash, ReceiptHashInput};

/// Limits enforced by `emit` (spec §4.2.1 step 3), sourced from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct EmitLimits {
    pub body_cap_bytes: usize,
    pub parents_cap: usize,
    pub artifacts_cap: usize,
}

/// Inputs to `ReceiptLedger::emit` (spec §4.2.1).
pub struct EmitInput<'a> {
    pub receipt_type: ReceiptType,
    pub from: &'a Principal,
    pub to: &'a Principal,
    pub task_id: Option<TaskId>,
    pub lease_id: Option<LeaseId>,
    pub schedule_id: Option<&'a str>,
    pub parents: &'a [Uuid],
    pub body: Value,
    pub owning_instance: &'a str,
}

/// The outcome of an `emit` call: the ordinary case is just the stored row; the
/// lenient `task.completed`-without-evidence path also signals
/// [`AnomalyAccepted`] (spec §4.2.1 step 5), which is a warning, not an error.
pub struct EmitOutcome {
    pub receipt: ReceiptRow,
    pub anomaly: Option<AnomalyAccepted>,
}

/// The append-only receipt store: hashing, size/terminator validation, dedup, and
/// the open-obligations query, all in one place (spec §4.2).
#[derive(Clone)]
pub struct ReceiptLedger {
    limits: EmitLimits,
}

impl ReceiptLedger {
    pub fn new(limits: EmitLimits) -> Self {
        Self { limits }
    }

    /// Emit a receipt on the given connection (spec §4.2.1, all six steps).
    ///
    /// Callers needing atomicity with a task state change pass `&mut *tx`; standalone
    /// emissions (e.g. `ack_receipt`) can pass a pooled connection directly.
    pub async fn emit(
        &self,
        conn: &mut PgConnection,
        tenant_id: TenantId,
        input: EmitInput<'_>,
        now: DateTime<Utc>,
    ) -> Result<EmitOutcome> {
        // Step 3: size limits.
        let body_bytes = serde_json::to_vec(&input.body).map_err(|e| AsyncGateError::Internal(e.into()))?;
        if body_bytes.len() > self.limits.body_cap_bytes {
            return Err(AsyncGateError::IntegrityViolation);
        }
        if input.parents.len() > self.limits.parents_cap {
            return Err(AsyncGateError::IntegrityViolation);
        }
        if let Some(artifacts) = input.body.get("artifacts").and_then(|v| v.as_array()) {
            if artifacts.len() > self.limits.artifacts_cap {
                return Err(AsyncGateError::IntegrityViolation);
            }
        }

        // Step 4: terminator receipts must carry parents that exist in-tenant.
        if termination::is_terminal_type(input.receipt_type) {
            if input.parents.is_empty() {
                return Err(AsyncGateError::IntegrityViolation);
            }
            for parent_id in input.parents {
                if !queries::receipt_exists(conn, tenant_id, *parent_id).await? {
                    return Err(AsyncGateError::IntegrityViolation);
                }
            }
        }

        // Step 5: task.completed leniency — accept without evidence, keep the
        // obligation open, and flag an anomaly instead of rejecting.
        let mut parents = input.parents.to_vec();
        let mut anomaly = None;
        if input.receipt_type == ReceiptType::TaskCompleted {
            let has_evidence = input.body.get("artifacts").is_some() || input.body.get("delivery_proof").is_some();
            if !has_evidence {
                warn!(
                    task_id = ?input.task_id,
                    "task.completed accepted without artifacts or delivery_proof; obligation remains open"
                );
                parents.clear();
                anomaly = Some(AnomalyAccepted);
            }
        }

        // Steps 1-2: canonical hash.
        let hash = receipt_hash(&ReceiptHashInput {
            receipt_type: input.receipt_type.as_str(),
            task_id: input.task_id.map(|id| id.into()),
            from: input.from,
            to: input.to,
            lease_id: input.lease_id.map(|id| id.into()),
            parents: &parents,
            body: &input.body,
        });

        // Step 6: idempotent insert.
        let receipt_id = ReceiptId::new();
        let receipt = queries::insert_receipt(
            conn,
            queries::NewReceipt {
                tenant_id,
                receipt_id,
                receipt_type: input.receipt_type,
                from: input.from,
                to: input.to,
                task_id: input.task_id,
                lease_id: input.lease_id,
                schedule_id: input.schedule_id,
                parents: &parents,
                body: &input.body,
                hash: &hash,
                owning_instance: input.owning_instance,
                now,
            },
        )
        .await?;

        // If a system.anomaly receipt should accompany this one, emit it now,
        // addressed from the service principal to the same owner, with the stored
        // receipt as its sole parent so provenance stays auditable.
        if anomaly.is_some() {
            let anomaly_body = serde_json::json!({
                "reason": "task.completed without locatable evidence",
                "receipt_id": receipt.receipt_id,
            });
            let anomaly_hash = receipt_hash(&ReceiptHashInput {
                receipt_type: ReceiptType::SystemAnomaly.as_str(),
                task_id: input.task_id.map(|id| id.into()),
                from: &Principal::service(),
                to: input.to,
                lease_id: None,
                parents: &[receipt.receipt_id.into()],
                body: &anomaly_body,
            });
            queries::insert_receipt(
                conn,
                queries::NewReceipt {
                    tenant_id,
                    receipt_id: ReceiptId::new(),
                    receipt_type: ReceiptType::SystemAnomaly,
                    from: &Principal::service(),
                    to: input.to,
                    task_id: input.task_id,
                    lease_id: None,
                    schedule_id: None,
                    parents: &[receipt.receipt_id.into()],
                    body: &anomaly_body,
                    hash: &anomaly_hash,
                    owning_instance: input.owning_instance,
                    now,
                },
            )
            .await?;
        }

        Ok(EmitOutcome { receipt, anomaly })
    }

    /// Two-query open-obligations lookup (spec §4.2.3): candidates bound at
    /// `min(limit*3, 1000)`, then a single batch containment check.
    pub async fn list_open_obligations(
        &self,
        conn: &mut PgConnection,
        tenant_id: TenantId,
        to_kind: PrincipalKind,
        to_id: &str,
        since_created_at: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ReceiptRow>> {
        let candidate_limit = (limit.saturating_mul(3)).min(1000);
        let obligation_types = termination::obligation_types();
        let terminator_types: Vec<ReceiptType> = termination::terminal_types().into_iter().collect();
        let mut open = queries::list_open_obligations(
            conn,
            tenant_id,
            to_kind,
            to_id,
            &obligation_types,
            &terminator_types,
            since_created_at,
            candidate_limit,
        )
        .await?;
        open.truncate(limit.max(0) as usize);
        Ok(open)
    }

    pub async fn has_terminator(&self, conn: &mut PgConnection, tenant_id: TenantId, parent_id: Uuid) -> Result<bool> {
        let terminator_types: Vec<ReceiptType> = termination::terminal_types().into_iter().collect();
        queries::has_terminator(conn, tenant_id, parent_id, &terminator_types).await
    }

    pub async fn get_terminators(
        &self,
        conn: &mut PgConnection,
        tenant_id: TenantId,
        parent_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ReceiptRow>> {
        let terminator_types: Vec<ReceiptType> = termination::terminal_types().into_iter().collect();
        queries::get_terminators(conn, tenant_id, parent_id, &terminator_types, limit).await
    }

    pub async fn latest_terminator(
        &self,
        conn: &mut PgConnection,
        tenant_id: TenantId,
        parent_id: Uuid,
    ) -> Result<Option<ReceiptRow>> {
        let terminator_types: Vec<ReceiptType> = termination::terminal_types().into_iter().collect();
        queries::latest_terminator(conn, tenant_id, parent_id, &terminator_types).await
    }
}
