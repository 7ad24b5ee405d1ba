//! Lease Sweeper (spec §4.4): reclaims leases abandoned by dead or stalled workers.
//!
//! A single long-running loop per process instance, in the teacher's `Service`
//! shape (`kernel/jobs/worker.rs`'s `JobWorker::run`): claim -> process ->
//! sleep-or-shutdown-select -> repeat. Every lease is requeued in its own
//! savepoint so one bad row never stops the sweep, and `owning_instance`
//! partitioning means a sweeper only ever touches tasks its own process created.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::principal::Principal;
use crate::config::Config;
use crate::contracts::Clock;
use crate::error::Result;
use crate::ledger::{EmitInput, ReceiptLedger};
use crate::metrics::Metrics;
use crate::storage::models::ReceiptType;
use crate::storage::{queries, Store};

/// Leases fetched per tick (spec §4.4 step 2: "up to 100"), independent of the
/// `batch_size` that governs commit/micro-sleep granularity within a tick.
const SWEEP_FETCH_LIMIT: i64 = 100;

/// Background lease reclamation loop (spec §4.4).
pub struct LeaseSweeper {
    store: Store,
    ledger: ReceiptLedger,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    instance_id: Arc<str>,
    metrics: Metrics,
}

/// Outcome of one tick, surfaced to `GET /v1/system/metrics` and the
/// operator-triggered `POST /v1/system/sweep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOutcome {
    pub expired: usize,
    pub errors: usize,
}

impl LeaseSweeper {
    pub fn new(
        store: Store,
        ledger: ReceiptLedger,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<Arc<str>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            clock,
            instance_id: instance_id.into(),
            metrics,
        }
    }

    /// Run the sweeper until `shutdown` is signalled (spec §4.4 steps 1-4).
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(instance_id = %self.instance_id, "lease sweeper starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let outcome = self.tick().await;
            if outcome.errors > 0 {
                warn!(errors = outcome.errors, expired = outcome.expired, "sweep tick completed with errors");
            } else if outcome.expired > 0 {
                info!(expired = outcome.expired, "sweep tick reclaimed expired leases");
            }

            let jitter = 0.8 + fastrand::f64() * 0.4;
            let interval = self.config.sweep_interval.mul_f64(jitter);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        info!(instance_id = %self.instance_id, "lease sweeper stopped");
        Ok(())
    }

    /// One pass over this instance's expired leases (spec §4.4 steps 2-4). Exposed
    /// standalone so `POST /v1/system/sweep` can trigger an out-of-band tick.
    pub async fn tick(&self) -> SweepOutcome {
        let tick_started = std::time::Instant::now();
        let now = self.clock.now();
        let expired = match self.store.get_expired_leases(&self.instance_id, now, SWEEP_FETCH_LIMIT).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to fetch expired leases");
                return SweepOutcome::default();
            }
        };

        let mut outcome = SweepOutcome::default();
        for (i, lease) in expired.iter().enumerate() {
            match self.reclaim_one(lease, now).await {
                Ok(true) => outcome.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    outcome.errors += 1;
                    error!(error = %e, lease_id = %lease.lease_id, task_id = %lease.task_id, "failed to reclaim expired lease");
                }
            }

            // Micro-sleep every batch_size leases to avoid transaction pile-up.
            if (i as i64 + 1) % self.config.sweep_batch_size == 0 {
                let micro = Duration::from_millis(10 + (fastrand::f64() * 40.0) as u64);
                sleep(micro).await;
            }
        }

        if outcome.expired > 0 {
            self.metrics.record_leases_expired(outcome.expired as u64);
        }
        self.metrics.record_sweep_tick(tick_started.elapsed());
        outcome
    }

    /// Reclaim a single lease in its own savepoint (spec §4.4 step 3). Returns
    /// `Ok(false)` for the "skip" case (task missing or already terminal), which is
    /// not an error.
    async fn reclaim_one(&self, lease: &crate::storage::models::LeaseRow, now: chrono::DateTime<chrono::Utc>) -> Result<bool> {
        let tenant_id = lease.tenant_id;
        let task_id = lease.task_id;

        let mut tx = self.store.begin().await?;
        let task = match queries::get_task(&mut tx, tenant_id, task_id).await? {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.is_terminal() {
            return Ok(false);
        }

        let jitter_seconds = fastrand::f64() * 5.0;
        queries::requeue_on_expiry(&mut tx, tenant_id, task_id, jitter_seconds, now).await?;
        queries::release_lease(&mut tx, tenant_id, task_id).await?;

        let assigned = queries::get_task_assigned_receipt(&mut tx, tenant_id, task_id).await?;
        if let Some(assigned) = assigned {
            let owner = assigned.to_principal();
            self.ledger
                .emit(
                    &mut tx,
                    tenant_id,
                    EmitInput {
                        receipt_type: ReceiptType::LeaseExpired,
                        from: &Principal::service(),
                        to: &owner,
                        task_id: Some(task_id),
                        lease_id: Some(lease.lease_id),
                        schedule_id: None,
                        parents: &[assigned.receipt_id.into()],
                        body: serde_json::json!({
                            "previous_worker_id": lease.worker_id,
                            "attempt": task.attempt,
                            "requeued": true,
                        }),
                        owning_instance: &self.instance_id,
                    },
                    now,
                )
                .await?;
        } else {
            warn!(task_id = %task_id, "expired lease's task has no task.assigned receipt; skipping lease.expired emission");
        }

        tx.commit().await?;
        Ok(true)
    }
}
