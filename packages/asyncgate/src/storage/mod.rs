//! Storage (spec §4.1): the durable task/lease/receipt state behind everything else.
//!
//! `queries` holds the raw SQL, each function taking `&mut PgConnection` so it
//! composes inside a transaction. `Store` is the ergonomic, pool-backed facade
//! used directly by HTTP handlers and tests; the Task Engine and Lease Sweeper open
//! their own transactions with [`Store::begin`] when an operation must combine a
//! state change with a receipt write atomically.

pub mod models;
pub mod queries;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::common::entity_ids::{LeaseId, ReceiptId, TaskId, TenantId};
use crate::common::principal::{Principal, PrincipalKind};
use crate::error::Result;

pub use models::{LeaseRow, ProgressRow, ReceiptRow, ReceiptType, RelationshipRow, TaskRow, TaskStatus};
pub use queries::{Claimed, NewReceipt, NewTask, TaskFilters, TaskResultUpdate};

/// Durable state behind the Task Engine and Lease Sweeper, backed by Postgres.
///
/// Cloning is cheap: `sqlx::PgPool` is an `Arc` handle, so every clone shares one
/// connection pool (`kernel/jobs`'s `ServerKernel` does the same with its pool).
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start a transaction for callers that need several writes to land atomically.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn create_task(&self, new: NewTask<'_>) -> Result<(TaskRow, bool)> {
        let mut conn = self.pool.acquire().await?;
        queries::create_task(&mut conn, new).await
    }

    pub async fn get_task(&self, tenant_id: TenantId, task_id: TaskId) -> Result<Option<TaskRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_task(&mut conn, tenant_id, task_id).await
    }

    pub async fn get_task_by_idempotency_key(&self, tenant_id: TenantId, key: &str) -> Result<Option<TaskRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_task_by_idempotency_key(&mut conn, tenant_id, key).await
    }

    pub async fn list_tasks(
        &self,
        tenant_id: TenantId,
        filters: &TaskFilters,
        cursor: Option<DateTime<Utc>>,
        fetch_limit: i64,
    ) -> Result<Vec<TaskRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::list_tasks(&mut conn, tenant_id, filters, cursor, fetch_limit).await
    }

    pub async fn update_task_status(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        new_status: TaskStatus,
        result: TaskResultUpdate,
        now: DateTime<Utc>,
    ) -> Result<TaskRow> {
        let mut conn = self.pool.acquire().await?;
        queries::update_task_status(&mut conn, tenant_id, task_id, new_status, result, now).await
    }

    pub async fn set_started_at(&self, tenant_id: TenantId, task_id: TaskId, now: DateTime<Utc>) -> Result<TaskRow> {
        let mut conn = self.pool.acquire().await?;
        queries::set_started_at(&mut conn, tenant_id, task_id, now).await
    }

    pub async fn requeue_with_backoff(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        max_backoff_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<TaskRow> {
        let mut conn = self.pool.acquire().await?;
        queries::requeue_with_backoff(&mut conn, tenant_id, task_id, max_backoff_seconds, now).await
    }

    pub async fn requeue_on_expiry(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        jitter_seconds: f64,
        now: DateTime<Utc>,
    ) -> Result<TaskRow> {
        let mut conn = self.pool.acquire().await?;
        queries::requeue_on_expiry(&mut conn, tenant_id, task_id, jitter_seconds, now).await
    }

    /// Claims tasks in its own transaction (spec §4.1 requires the skip-locked
    /// select, lease insert, and status flip to be atomic).
    pub async fn claim_tasks(
        &self,
        tenant_id: TenantId,
        worker_id: &str,
        capabilities: &[String],
        accept_types: Option<&[String]>,
        n: i64,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claimed>> {
        let mut tx = self.pool.begin().await?;
        let claimed = queries::claim_tasks(&mut tx, tenant_id, worker_id, capabilities, accept_types, n, ttl_seconds, now)
            .await?;
        tx.commit().await?;
        Ok(claimed)
    }

    pub async fn get_lease(&self, tenant_id: TenantId, task_id: TaskId) -> Result<Option<LeaseRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_lease(&mut conn, tenant_id, task_id).await
    }

    pub async fn validate_lease(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        lease_id: LeaseId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::validate_lease(&mut conn, tenant_id, task_id, lease_id, worker_id, now).await
    }

    /// Runs in its own transaction: the `FOR UPDATE` row lock `queries::renew_lease`
    /// takes on the current lease only holds for the statements that follow it if
    /// both run inside one transaction, not just one connection.
    pub async fn renew_lease(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        lease_id: LeaseId,
        worker_id: &str,
        extend_by_seconds: i64,
        max_renewals: i32,
        max_lifetime_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<LeaseRow> {
        let mut tx = self.pool.begin().await?;
        let row = queries::renew_lease(
            &mut tx,
            tenant_id,
            task_id,
            lease_id,
            worker_id,
            extend_by_seconds,
            max_renewals,
            max_lifetime_seconds,
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn release_lease(&self, tenant_id: TenantId, task_id: TaskId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        queries::release_lease(&mut conn, tenant_id, task_id).await
    }

    pub async fn get_expired_leases(&self, instance_id: &str, now: DateTime<Utc>, limit: i64) -> Result<Vec<LeaseRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_expired_leases(&mut conn, instance_id, now, limit).await
    }

    pub async fn upsert_progress(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        progress: Value,
        now: DateTime<Utc>,
    ) -> Result<ProgressRow> {
        let mut conn = self.pool.acquire().await?;
        queries::upsert_progress(&mut conn, tenant_id, task_id, progress, now).await
    }

    pub async fn get_progress(&self, tenant_id: TenantId, task_id: TaskId) -> Result<Option<ProgressRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_progress(&mut conn, tenant_id, task_id).await
    }

    pub async fn upsert_relationship(
        &self,
        tenant_id: TenantId,
        principal_kind: PrincipalKind,
        principal_id: &str,
        principal_instance_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RelationshipRow> {
        let mut conn = self.pool.acquire().await?;
        queries::upsert_relationship(&mut conn, tenant_id, principal_kind, principal_id, principal_instance_id, now)
            .await
    }

    pub async fn get_receipt(&self, tenant_id: TenantId, receipt_id: ReceiptId) -> Result<Option<ReceiptRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_receipt(&mut conn, tenant_id, receipt_id).await
    }

    pub async fn receipt_exists(&self, tenant_id: TenantId, receipt_id: Uuid) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        queries::receipt_exists(&mut conn, tenant_id, receipt_id).await
    }

    pub async fn get_task_assigned_receipt(&self, tenant_id: TenantId, task_id: TaskId) -> Result<Option<ReceiptRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_task_assigned_receipt(&mut conn, tenant_id, task_id).await
    }

    pub async fn list_receipts(
        &self,
        tenant_id: TenantId,
        to_kind: PrincipalKind,
        to_id: &str,
        since_created_at: Option<DateTime<Utc>>,
        fetch_limit: i64,
    ) -> Result<Vec<ReceiptRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::list_receipts(&mut conn, tenant_id, to_kind, to_id, since_created_at, fetch_limit).await
    }

    pub async fn mark_delivered(&self, tenant_id: TenantId, receipt_ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        queries::mark_delivered(&mut conn, tenant_id, receipt_ids, now).await
    }

    /// Insert a receipt outside any caller-managed transaction. The Task Engine uses
    /// `queries::insert_receipt` directly against its own `&mut tx` instead, so the
    /// state write and the receipt write commit or roll back together.
    pub async fn insert_receipt(&self, new: NewReceipt<'_>) -> Result<ReceiptRow> {
        let mut conn = self.pool.acquire().await?;
        queries::insert_receipt(&mut conn, new).await
    }
}

/// A principal's ledger address, as used by receipt-routing queries.
pub struct PrincipalRef<'a> {
    pub kind: PrincipalKind,
    pub id: &'a str,
}

impl<'a> From<&'a Principal> for PrincipalRef<'a> {
    fn from(p: &'a Principal) -> Self {
        PrincipalRef { kind: p.kind, id: &p.id }
    }
}
