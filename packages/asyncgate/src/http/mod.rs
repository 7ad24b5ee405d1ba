//! HTTP boundary (spec §6): one axum route per engine operation, thin enough that
//! every real decision still lives in `engine`/`ledger`/`sweeper`.
//!
//! Wiring follows the teacher's `server/app.rs` shape (shared `AppState` behind
//! `with_state`, `tower_http::trace`/`cors` layers, `axum::Router`) generalized
//! from its GraphQL-plus-REST-health mix down to a pure JSON REST surface —
//! AsyncGate has no GraphQL schema to serve.

pub mod extractors;
pub mod system;
pub mod tasker;
pub mod taskee;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::contracts::{AuthResolver, TenantResolver};
use crate::engine::TaskEngine;
use crate::error::AsyncGateError;
use crate::metrics::Metrics;
use crate::sweeper::LeaseSweeper;

/// Shared state handed to every handler (spec §4.6's collaborators, plus the
/// engine and metrics registry they sit behind).
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TaskEngine>,
    pub sweeper: Arc<LeaseSweeper>,
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub auth_resolver: Arc<dyn AuthResolver>,
    pub tenant_resolver: Arc<dyn TenantResolver>,
}

/// Build the full router (spec §6's route table).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/tasks", post(tasker::create_task).get(tasker::list_tasks))
        .route("/v1/tasks/:task_id", get(tasker::get_task))
        .route("/v1/tasks/:task_id/cancel", post(tasker::cancel_task))
        .route("/v1/receipts", get(tasker::list_receipts))
        .route("/v1/receipts/:receipt_id/ack", post(tasker::ack_receipt))
        .route("/v1/obligations", get(tasker::list_open_obligations))
        .route("/v1/leases", post(taskee::claim_tasks))
        .route("/v1/leases/:lease_id/renew", post(taskee::renew_lease))
        .route("/v1/leases/:lease_id/progress", post(taskee::report_progress))
        .route("/v1/leases/:lease_id/start", post(taskee::start_task))
        .route("/v1/leases/:lease_id/complete", post(taskee::complete))
        .route("/v1/leases/:lease_id/fail", post(taskee::fail))
        .route("/v1/system/sweep", post(system::sweep))
        .route("/v1/system/config", get(system::get_config))
        .route("/v1/system/metrics", get(system::get_metrics))
        .route("/health", get(system::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map `AsyncGateError` onto spec §7's retry guidance: transient kinds (lease
/// conflicts, rate limiting) get a status worth retrying; terminal kinds don't.
pub fn error_response(err: &AsyncGateError) -> Response {
    let status = match err {
        AsyncGateError::TaskNotFound => StatusCode::NOT_FOUND,
        AsyncGateError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        AsyncGateError::LeaseInvalidOrExpired => StatusCode::CONFLICT,
        AsyncGateError::LeaseRenewalLimitExceeded { .. } => StatusCode::CONFLICT,
        AsyncGateError::LeaseLifetimeExceeded { .. } => StatusCode::CONFLICT,
        AsyncGateError::Unauthorized => StatusCode::FORBIDDEN,
        AsyncGateError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        AsyncGateError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        AsyncGateError::IntegrityViolation => StatusCode::UNPROCESSABLE_ENTITY,
        AsyncGateError::Database(_) | AsyncGateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

impl IntoResponse for AsyncGateError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
