//! Integration tests for the Task Engine's scenarios S1-S6 and the transactional
//! invariants that only a real Postgres can exercise (at-most-one-worker via
//! `FOR UPDATE SKIP LOCKED`, savepoint isolation, hash dedup).

mod common;

use asyncgate_core::common::entity_ids::TenantId;
use asyncgate_core::common::principal::{Principal, PrincipalKind};
use asyncgate_core::engine::{CancelTaskInput, ClaimTasksInput, CompleteInput, CreateTaskInput, FailInput};
use asyncgate_core::error::AsyncGateError;
use asyncgate_core::storage::models::{ReceiptType, TaskStatus};
use common::EngineHarness;
use serde_json::json;
use test_context::test_context;

fn agent(id: &str) -> Principal {
    Principal::new(PrincipalKind::Agent, id)
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn s1_happy_path(ctx: &EngineHarness) {
    let tenant_id = TenantId::new();

    let outcome = ctx
        .engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: "t.demo",
            payload: json!({"k": 1}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: None,
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task");
    assert!(outcome.created);
    assert_eq!(outcome.status, TaskStatus::Queued);

    let leases = ctx
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W1",
            capabilities: vec!["demo".to_string()],
            accept_types: Some(vec!["t.demo".to_string()]),
            max_tasks: 1,
            lease_ttl_seconds: None,
        })
        .await
        .expect("claim_tasks");
    assert_eq!(leases.len(), 1);
    let lease = &leases[0];
    assert_eq!(lease.task_id, outcome.task_id);
    assert_eq!(lease.attempt, 0);

    let obligations_while_leased = ctx
        .engine
        .list_open_obligations(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_open_obligations");
    assert!(
        !obligations_while_leased.is_empty(),
        "task.assigned obligation must stay open while merely leased"
    );

    ctx.engine
        .start_task(tenant_id, lease.task_id, lease.lease_id, "W1")
        .await
        .expect("start_task");

    let (task, complete_outcome) = ctx
        .engine
        .complete(CompleteInput {
            tenant_id,
            task_id: lease.task_id,
            lease_id: lease.lease_id,
            worker_id: "W1",
            result_summary: json!("ok"),
            result_payload: None,
            artifacts: Some(json!([{"type": "s3", "url": "s3://b/k"}])),
            delivery_proof: None,
            metadata: None,
        })
        .await
        .expect("complete");
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert!(complete_outcome.anomaly.is_none());

    let receipts = ctx
        .engine
        .list_receipts(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_receipts");
    let types: Vec<ReceiptType> = receipts.iter().map(|r| r.receipt_type).collect();
    assert_eq!(
        types,
        vec![
            ReceiptType::TaskAssigned,
            ReceiptType::TaskAccepted,
            ReceiptType::TaskStarted,
            ReceiptType::TaskCompleted,
            ReceiptType::TaskResultReady,
        ]
    );

    let obligations = ctx
        .engine
        .list_open_obligations(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_open_obligations");
    assert!(obligations.is_empty());
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn s2_lost_authority_requeue(ctx: &EngineHarness) {
    let tenant_id = TenantId::new();
    let created = ctx
        .engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: "t.demo",
            payload: json!({}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: None,
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task");

    let leases = ctx
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W1",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: Some(1),
        })
        .await
        .expect("claim_tasks");
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].attempt, 0);

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let sweeper = asyncgate_core::sweeper::LeaseSweeper::new(
        ctx.engine.store().clone(),
        make_ledger(ctx),
        ctx.config.clone(),
        ctx.clock.clone(),
        "test-instance-1",
        asyncgate_core::metrics::Metrics::new(),
    );
    let sweep_outcome = sweeper.tick().await;
    assert_eq!(sweep_outcome.expired, 1);
    assert_eq!(sweep_outcome.errors, 0);

    let task = ctx
        .engine
        .get_task(tenant_id, created.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempt, 0, "lease expiry must not increment attempt");

    let receipts = ctx
        .engine
        .list_receipts(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_receipts");
    assert!(receipts.iter().any(|r| r.receipt_type == ReceiptType::LeaseExpired));
    assert!(!receipts.iter().any(|r| r.receipt_type == ReceiptType::TaskResultReady));

    let obligations_after_requeue = ctx
        .engine
        .list_open_obligations(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_open_obligations");
    assert!(
        !obligations_after_requeue.is_empty(),
        "lease.expired is not a registered terminator; the obligation must stay open after requeue"
    );

    let leases_w2 = ctx
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W2",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: None,
        })
        .await
        .expect("claim_tasks by W2");
    assert_eq!(leases_w2.len(), 1);
    assert_eq!(leases_w2[0].task_id, created.task_id);
}

fn make_ledger(ctx: &EngineHarness) -> asyncgate_core::ledger::ReceiptLedger {
    asyncgate_core::ledger::ReceiptLedger::new(asyncgate_core::ledger::EmitLimits {
        body_cap_bytes: ctx.config.receipt_body_cap_bytes,
        parents_cap: ctx.config.receipt_parents_cap,
        artifacts_cap: ctx.config.receipt_artifacts_cap,
    })
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn s3_retry_consumes_attempt_then_fails_terminally(ctx: &EngineHarness) {
    let tenant_id = TenantId::new();
    let _created = ctx
        .engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: "t.demo",
            payload: json!({}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: Some(2),
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task");

    let lease1 = &ctx
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W1",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: None,
        })
        .await
        .expect("claim #1")[0]
        .clone();

    let fail1 = ctx
        .engine
        .fail(FailInput {
            tenant_id,
            task_id: lease1.task_id,
            lease_id: lease1.lease_id,
            worker_id: "W1",
            retryable: true,
            error: json!({"msg": "x"}),
        })
        .await
        .expect("fail #1");
    assert!(fail1.requeued);
    assert_eq!(fail1.task.status, TaskStatus::Queued);
    assert_eq!(fail1.task.attempt, 1);

    let lease2 = &ctx
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W2",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: None,
        })
        .await
        .expect("claim #2")[0]
        .clone();

    let fail2 = ctx
        .engine
        .fail(FailInput {
            tenant_id,
            task_id: lease2.task_id,
            lease_id: lease2.lease_id,
            worker_id: "W2",
            retryable: true,
            error: json!({"msg": "x again"}),
        })
        .await
        .expect("fail #2");
    assert!(!fail2.requeued);
    assert_eq!(fail2.task.status, TaskStatus::Failed);
    assert_eq!(fail2.task.attempt, 2);

    let receipts = ctx
        .engine
        .list_receipts(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_receipts");
    assert!(receipts.iter().any(|r| r.receipt_type == ReceiptType::TaskFailed));
    assert!(receipts.iter().any(|r| r.receipt_type == ReceiptType::TaskResultReady));
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn s4_idempotent_create_returns_same_task_once(ctx: &EngineHarness) {
    let tenant_id = TenantId::new();
    let input = || CreateTaskInput {
        tenant_id,
        task_type: "t.demo",
        payload: json!({"k": 1}),
        created_by: &agent("A1"),
        caller_is_internal: false,
        principal_ai: "A1",
        requirements: None,
        priority: None,
        idempotency_key: Some("k1"),
        max_attempts: None,
        retry_backoff_seconds: None,
        delay_seconds: None,
        expected_outcome_kind: None,
        expected_artifact_mime: None,
    };

    let first = ctx.engine.create_task(input()).await.expect("create #1");
    let second = ctx.engine.create_task(input()).await.expect("create #2");
    assert_eq!(first.task_id, second.task_id);
    assert!(first.created);
    assert!(!second.created);

    let receipts = ctx
        .engine
        .list_receipts(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_receipts");
    let assigned_count = receipts.iter().filter(|r| r.receipt_type == ReceiptType::TaskAssigned).count();
    assert_eq!(assigned_count, 1);
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn s5_hash_sensitive_to_parents(ctx: &EngineHarness) {
    let tenant_id = TenantId::new();
    let _created = ctx
        .engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: "t.demo",
            payload: json!({}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: Some(3),
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task");

    let lease1 = ctx
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W1",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: None,
        })
        .await
        .expect("claim #1")[0]
        .clone();
    ctx.engine
        .complete(CompleteInput {
            tenant_id,
            task_id: lease1.task_id,
            lease_id: lease1.lease_id,
            worker_id: "W1",
            result_summary: json!("ok"),
            result_payload: None,
            artifacts: Some(json!([{"type": "t", "uri": "u"}])),
            delivery_proof: None,
            metadata: None,
        })
        .await
        .expect("complete");

    let receipts1 = ctx
        .engine
        .list_receipts(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_receipts #1");
    let hash1 = receipts1
        .iter()
        .find(|r| r.receipt_type == ReceiptType::TaskCompleted)
        .expect("task.completed #1")
        .hash
        .clone();

    let created2 = ctx
        .engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: "t.demo",
            payload: json!({}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: Some(3),
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task #2");
    let lease2 = ctx
        .engine
        .claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W2",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: None,
        })
        .await
        .expect("claim #2")[0]
        .clone();
    ctx.engine
        .complete(CompleteInput {
            tenant_id,
            task_id: lease2.task_id,
            lease_id: lease2.lease_id,
            worker_id: "W2",
            result_summary: json!("ok"),
            result_payload: None,
            artifacts: Some(json!([{"type": "t", "uri": "u"}])),
            delivery_proof: None,
            metadata: None,
        })
        .await
        .expect("complete #2");

    let receipts2 = ctx
        .engine
        .list_receipts(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_receipts #2");
    let hash2 = receipts2
        .iter()
        .find(|r| r.receipt_type == ReceiptType::TaskCompleted && r.task_id == Some(created2.task_id))
        .expect("task.completed #2")
        .hash
        .clone();

    assert_ne!(hash1, hash2, "identical body but distinct parents must hash differently");
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn s6_cancel_by_non_owner_non_internal_is_unauthorized(ctx: &EngineHarness) {
    let tenant_id = TenantId::new();
    let created = ctx
        .engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: "t.demo",
            payload: json!({}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: None,
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task");

    let err = ctx
        .engine
        .cancel_task(CancelTaskInput {
            tenant_id,
            task_id: created.task_id,
            caller: &agent("A2"),
            caller_is_internal: false,
            reason: None,
        })
        .await
        .expect_err("non-owner, non-internal cancel must be rejected");
    assert!(matches!(err, AsyncGateError::Unauthorized));

    let task = ctx
        .engine
        .get_task(tenant_id, created.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.status, TaskStatus::Queued);

    let receipts = ctx
        .engine
        .list_receipts(tenant_id, &agent("A1"), None, 50)
        .await
        .expect("list_receipts");
    assert!(!receipts.iter().any(|r| r.receipt_type == ReceiptType::TaskCanceled));
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn claim_tasks_is_at_most_one_worker_under_concurrency(ctx: &EngineHarness) {
    let tenant_id = TenantId::new();
    ctx.engine
        .create_task(CreateTaskInput {
            tenant_id,
            task_type: "t.demo",
            payload: json!({}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: None,
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task");

    let engine1 = ctx.engine.clone();
    let engine2 = ctx.engine.clone();
    let (r1, r2) = tokio::join!(
        engine1.claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W1",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: None,
        }),
        engine2.claim_tasks(ClaimTasksInput {
            tenant_id,
            worker_id: "W2",
            capabilities: vec![],
            accept_types: None,
            max_tasks: 1,
            lease_ttl_seconds: None,
        }),
    );
    let claimed_total = r1.expect("claim W1").len() + r2.expect("claim W2").len();
    assert_eq!(claimed_total, 1, "exactly one worker must win the lease");
}

#[test_context(EngineHarness)]
#[tokio::test]
async fn caller_principal_cannot_act_on_other_tenants_tasks(ctx: &EngineHarness) {
    let tenant_a = TenantId::new();
    let tenant_b = TenantId::new();
    let created = ctx
        .engine
        .create_task(CreateTaskInput {
            tenant_id: tenant_a,
            task_type: "t.demo",
            payload: json!({}),
            created_by: &agent("A1"),
            caller_is_internal: false,
            principal_ai: "A1",
            requirements: None,
            priority: None,
            idempotency_key: None,
            max_attempts: None,
            retry_backoff_seconds: None,
            delay_seconds: None,
            expected_outcome_kind: None,
            expected_artifact_mime: None,
        })
        .await
        .expect("create_task");

    let task = ctx
        .engine
        .get_task(tenant_b, created.task_id)
        .await
        .expect("get_task under wrong tenant");
    assert!(task.is_none(), "a task must be invisible outside its own tenant");
}
