//! Shared Postgres-testcontainer harness for integration tests.
//!
//! One container is started and migrated once, then reused across every test
//! in the binary — the same shared-infrastructure shape as the teacher's
//! `tests/common/harness.rs`, minus the Redis container AsyncGate has no use
//! for.

use std::sync::Arc;

use anyhow::{Context, Result};
use asyncgate_core::config::{Config, Environment};
use asyncgate_core::contracts::{Clock, IdGen, SystemClock, UuidIdGen};
use asyncgate_core::engine::TaskEngine;
use asyncgate_core::ledger::{EmitLimits, ReceiptLedger};
use asyncgate_core::storage::Store;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};
use tokio::sync::OnceCell;

struct SharedTestInfra {
    db_url: String,
    _postgres: ContainerAsync<GenericImage>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = GenericImage::new("postgres", "16")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("failed to start postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("failed to connect to postgres for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        pool.close().await;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async { Self::init().await.expect("failed to init shared test infra") })
            .await
    }
}

/// One `TaskEngine` wired to a fresh connection pool against the shared
/// container, plus the handles a test needs to inspect raw rows.
pub struct EngineHarness {
    pub engine: TaskEngine,
    pub pool: PgPool,
    pub clock: Arc<dyn Clock>,
    pub idgen: Arc<dyn IdGen>,
    pub config: Arc<Config>,
}

impl EngineHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&infra.db_url)
            .await
            .context("failed to connect to test database")?;

        let config = Arc::new(Config {
            database_url: infra.db_url.clone(),
            bind_addr: "127.0.0.1:0".to_string(),
            environment: Environment::Development,
            instance_id_override: None,
            lease_ttl: std::time::Duration::from_secs(30),
            max_lease_ttl: std::time::Duration::from_secs(300),
            max_renewals: 10,
            max_lease_lifetime: std::time::Duration::from_secs(3600),
            default_max_attempts: 3,
            default_retry_backoff: std::time::Duration::from_secs(5),
            max_retry_backoff: std::time::Duration::from_secs(600),
            sweep_interval: std::time::Duration::from_secs(5),
            sweep_batch_size: 20,
            page_limit_default: 50,
            page_limit_max: 200,
            receipt_body_cap_bytes: 65536,
            receipt_parents_cap: 32,
            receipt_artifacts_cap: 16,
        });

        let store = Store::new(pool.clone());
        let ledger = ReceiptLedger::new(EmitLimits {
            body_cap_bytes: config.receipt_body_cap_bytes,
            parents_cap: config.receipt_parents_cap,
            artifacts_cap: config.receipt_artifacts_cap,
        });
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let idgen: Arc<dyn IdGen> = Arc::new(UuidIdGen);

        let engine = TaskEngine::new(store, ledger, config.clone(), clock.clone(), idgen.clone(), "test-instance-1");

        Ok(Self {
            engine,
            pool,
            clock,
            idgen,
            config,
        })
    }
}

impl AsyncTestContext for EngineHarness {
    async fn setup() -> Self {
        Self::new().await.expect("failed to create engine harness")
    }

    async fn teardown(self) {
        self.pool.close().await;
    }
}
