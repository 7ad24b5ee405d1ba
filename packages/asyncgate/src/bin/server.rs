//! The AsyncGate server binary: loads configuration, runs migrations, resolves
//! this process's Instance Identity, and serves the HTTP boundary with the Lease
//! Sweeper running alongside it.
//!
//! Startup sequence and logging setup follow the teacher's `bin/workflow_server.rs`
//! (`dotenvy::dotenv`, `tracing_subscriber::registry()...with(EnvFilter)`,
//! `PgPoolOptions`, bind-and-serve), generalized from its Restate-service wiring to
//! AsyncGate's engine/sweeper/http wiring.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use asyncgate_core::config::Config;
use asyncgate_core::contracts::{DevAuthResolver, SystemClock, UuidIdGen};
use asyncgate_core::engine::TaskEngine;
use asyncgate_core::http::{build_router, AppState};
use asyncgate_core::instance::{detect_instance_id, validate_instance_uniqueness};
use asyncgate_core::ledger::{EmitLimits, ReceiptLedger};
use asyncgate_core::metrics::Metrics;
use asyncgate_core::storage::Store;
use asyncgate_core::sweeper::LeaseSweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,asyncgate_core=debug".into()))
        .with(fmt::layer().with_target(true).with_line_number(true))
        .init();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);

    let instance_id = detect_instance_id(config.instance_id_override.as_deref());
    validate_instance_uniqueness(&instance_id, config.environment)
        .context("instance id failed startup validation")?;
    let instance_id: Arc<str> = Arc::from(instance_id);
    info!(instance_id = %instance_id, environment = ?config.environment, "starting asyncgate");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let store = Store::new(pool);
    let ledger = ReceiptLedger::new(EmitLimits {
        body_cap_bytes: config.receipt_body_cap_bytes,
        parents_cap: config.receipt_parents_cap,
        artifacts_cap: config.receipt_artifacts_cap,
    });
    let clock = Arc::new(SystemClock);
    let idgen = Arc::new(UuidIdGen);
    let metrics = Metrics::new();

    let engine = Arc::new(TaskEngine::new(
        store.clone(),
        ledger.clone(),
        config.clone(),
        clock.clone(),
        idgen,
        instance_id.clone(),
    ));

    let sweeper = Arc::new(LeaseSweeper::new(
        store,
        ledger,
        config.clone(),
        clock,
        instance_id.clone(),
        metrics.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sweeper_for_loop = sweeper.clone();
    let sweeper_shutdown = shutdown.clone();
    let sweeper_handle = tokio::spawn(async move {
        if let Err(e) = sweeper_for_loop.run(sweeper_shutdown).await {
            tracing::error!(error = %e, "lease sweeper exited with error");
        }
    });

    let app_state = AppState {
        engine,
        sweeper,
        config: config.clone(),
        metrics,
        auth_resolver: Arc::new(DevAuthResolver),
        tenant_resolver: Arc::new(asyncgate_core::contracts::DevTenantResolver),
    };
    let router = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await;

    sweeper_handle.abort();
    serve_result.context("server error")
}
