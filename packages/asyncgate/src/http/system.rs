//! System routes: operator-triggered sweep, config introspection, metrics
//! snapshot, and a plain health check (grounded on the teacher's
//! `server/routes/health.rs`, stripped to the one dependency AsyncGate actually
//! has — the database — instead of its GraphQL/event-bus checks).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::AppState;

pub async fn sweep(State(state): State<AppState>) -> Response {
    let outcome = state.sweeper.tick().await;
    Json(serde_json::json!({
        "expired": outcome.expired,
        "errors": outcome.errors,
    }))
    .into_response()
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub environment: &'static str,
    pub lease_ttl_seconds: u64,
    pub max_lease_ttl_seconds: u64,
    pub max_renewals: i32,
    pub max_lease_lifetime_seconds: u64,
    pub default_max_attempts: i32,
    pub default_retry_backoff_seconds: u64,
    pub max_retry_backoff_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub sweep_batch_size: i64,
    pub page_limit_default: i64,
    pub page_limit_max: i64,
    pub receipt_body_cap_bytes: usize,
    pub receipt_parents_cap: usize,
    pub receipt_artifacts_cap: usize,
}

pub async fn get_config(State(state): State<AppState>) -> Response {
    let config = &state.config;
    Json(ConfigView {
        environment: match config.environment {
            crate::config::Environment::Development => "development",
            crate::config::Environment::Staging => "staging",
            crate::config::Environment::Production => "production",
        },
        lease_ttl_seconds: config.lease_ttl.as_secs(),
        max_lease_ttl_seconds: config.max_lease_ttl.as_secs(),
        max_renewals: config.max_renewals,
        max_lease_lifetime_seconds: config.max_lease_lifetime.as_secs(),
        default_max_attempts: config.default_max_attempts,
        default_retry_backoff_seconds: config.default_retry_backoff.as_secs(),
        max_retry_backoff_seconds: config.max_retry_backoff.as_secs(),
        sweep_interval_seconds: config.sweep_interval.as_secs(),
        sweep_batch_size: config.sweep_batch_size,
        page_limit_default: config.page_limit_default,
        page_limit_max: config.page_limit_max,
        receipt_body_cap_bytes: config.receipt_body_cap_bytes,
        receipt_parents_cap: config.receipt_parents_cap,
        receipt_artifacts_cap: config.receipt_artifacts_cap,
    })
    .into_response()
}

pub async fn get_metrics(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_ok = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(state.engine.store().pool()),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if db_ok { "healthy" } else { "unhealthy" },
            database: if db_ok { "ok" } else { "error" },
        }),
    )
}
