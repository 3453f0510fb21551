// Worker runtime: PostgreSQL wiring around WorkflowEngine
// Decision: Handlers and the subject source are injected; the binary only ships `log`

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tenantflow_engine::clock::system_clock;
use tenantflow_engine::handler::{
    HandlerError, HandlerInvocation, HandlerRegistry, InMemorySubjectSource, SubjectSource,
};
use tenantflow_engine::{EngineQueues, PostgresExecutionStore, WorkerPoolConfig, WorkflowEngine};
use tracing::info;

use crate::config::WorkerConfig;

/// Handlers available in every worker
///
/// `log` records the step's params and context at `info` and succeeds.
pub fn builtin_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("log", |inv: HandlerInvocation| async move {
        info!(
            tenant_id = %inv.tenant_id,
            execution_id = %inv.execution_id,
            subject_record_id = %inv.subject_record_id,
            step_id = %inv.step_id,
            params = %inv.params,
            "log step"
        );
        Ok::<_, HandlerError>(json!({ "logged": true }))
    });
    handlers
}

/// A running worker process
pub struct WorkerRuntime {
    config: WorkerConfig,
    engine: WorkflowEngine,
}

impl WorkerRuntime {
    /// Connect with the built-in handlers and no subject source
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        Self::with_handlers(
            config,
            builtin_handlers(),
            Arc::new(InMemorySubjectSource::new()),
        )
        .await
    }

    /// Connect to PostgreSQL and wire the engine
    pub async fn with_handlers(
        config: WorkerConfig,
        handlers: HandlerRegistry,
        subjects: Arc<dyn SubjectSource>,
    ) -> Result<Self> {
        info!(
            worker_id = %config.worker_id,
            max_concurrent = config.max_concurrent_tasks,
            max_connections = config.database_max_connections,
            handlers = handlers.len(),
            "Initializing worker"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = PostgresExecutionStore::new(pool.clone());
        if config.run_migrations {
            store.migrate().await.context("Failed to run migrations")?;
        }

        let clock = system_clock();
        let engine = WorkflowEngine::builder()
            .with_store(Arc::new(store))
            .with_queues(EngineQueues::postgres(
                pool,
                clock.clone(),
                config.engine.queue_max_receives,
            ))
            .with_handlers(handlers)
            .with_subjects(subjects)
            .with_clock(clock)
            .with_config(config.engine.clone())
            .with_pool_config(
                WorkerPoolConfig::default()
                    .with_worker_id(config.worker_id.clone())
                    .with_max_concurrency(config.max_concurrent_tasks),
            )
            .build();

        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run every consumer and periodic job until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.engine
            .start()
            .context("Failed to start queue consumers")?;
        info!(worker_id = %self.config.worker_id, "Worker running");

        shutdown.await;

        info!("Draining in-flight messages");
        self.engine
            .shutdown()
            .await
            .context("Worker did not shut down cleanly")?;
        Ok(())
    }
}
