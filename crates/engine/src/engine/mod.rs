//! Workflow execution engine
//!
//! The components that move executions forward, and [`WorkflowEngine`],
//! which wires them to a store and four queues.
//!
//! ```text
//!  domain event ─► workflow-triggers ─► TriggerProcessor ─► store + workflow-steps
//!                        │                                        │
//!                        ▼ (exhausted)                            ▼
//!                 workflow-triggers-dlq                     StepExecutor ◄─┐
//!                        │                                   │    │        │ DelayScheduler
//!                        ▼                                   │    └────────┘ (send_at)
//!                  FailureProcessor ◄── workflow-steps-dlq ◄─┘ (exhausted)
//!
//!  periodic: RetentionCleanupJob, ScheduledTriggerPoller, StalledExecutionSweeper
//! ```

mod cleanup;
mod error;
mod executor;
mod failure;
mod scheduled;
mod sweeper;
mod trigger;

pub use cleanup::{CleanupReport, RetentionCleanupJob};
pub use error::EngineError;
pub use executor::{StepExecutor, StepOutcome};
pub use failure::{FailureOutcome, FailureProcessor};
pub use scheduled::{scheduled_event_type, ScheduleReport, ScheduledTriggerPoller};
pub use sweeper::StalledExecutionSweeper;
pub use trigger::{idempotency_key, TriggerProcessor, TriggerReport};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::{system_clock, SharedClock};
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::handler::{HandlerRegistry, InMemorySubjectSource, StepHandler, SubjectSource};
use crate::metrics::EngineMetrics;
use crate::persistence::{ExecutionStore, InMemoryExecutionStore};
use crate::queue::{
    DeadLetter, DelayScheduler, InMemoryQueue, MessageQueue, PostgresQueue, QueueDelayScheduler,
    StepMessage, TriggerMessage, STEP_DLQ, STEP_QUEUE, TRIGGER_DLQ, TRIGGER_QUEUE,
};
use crate::worker::{
    PeriodicJob, PeriodicTask, PollerConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError,
};

/// How often the cleanup job checks whether its daily slot has started
const CLEANUP_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// The four queues the engine runs on
#[derive(Clone)]
pub struct EngineQueues {
    pub triggers: Arc<dyn MessageQueue<TriggerMessage>>,
    pub trigger_dlq: Arc<dyn MessageQueue<DeadLetter<TriggerMessage>>>,
    pub steps: Arc<dyn MessageQueue<StepMessage>>,
    pub step_dlq: Arc<dyn MessageQueue<DeadLetter<StepMessage>>>,
}

impl EngineQueues {
    /// Process-local queues
    pub fn in_memory(clock: SharedClock, max_receives: u32) -> Self {
        let trigger_dlq: Arc<InMemoryQueue<DeadLetter<TriggerMessage>>> =
            Arc::new(InMemoryQueue::new(TRIGGER_DLQ).with_clock(clock.clone()));
        let step_dlq: Arc<InMemoryQueue<DeadLetter<StepMessage>>> =
            Arc::new(InMemoryQueue::new(STEP_DLQ).with_clock(clock.clone()));

        let triggers = InMemoryQueue::<TriggerMessage>::new(TRIGGER_QUEUE)
            .with_clock(clock.clone())
            .with_max_receives(max_receives)
            .with_dead_letter_queue(trigger_dlq.clone());
        let steps = InMemoryQueue::<StepMessage>::new(STEP_QUEUE)
            .with_clock(clock)
            .with_max_receives(max_receives)
            .with_dead_letter_queue(step_dlq.clone());

        Self {
            triggers: Arc::new(triggers),
            trigger_dlq,
            steps: Arc::new(steps),
            step_dlq,
        }
    }

    /// Queues stored in the `workflow_queue_messages` table
    pub fn postgres(pool: PgPool, clock: SharedClock, max_receives: u32) -> Self {
        let triggers = PostgresQueue::<TriggerMessage>::new(pool.clone(), TRIGGER_QUEUE)
            .with_max_receives(max_receives)
            .with_clock(clock.clone());
        let steps = PostgresQueue::<StepMessage>::new(pool, STEP_QUEUE)
            .with_max_receives(max_receives)
            .with_clock(clock);

        Self {
            trigger_dlq: Arc::new(triggers.dead_letter_queue()),
            step_dlq: Arc::new(steps.dead_letter_queue()),
            triggers: Arc::new(triggers),
            steps: Arc::new(steps),
        }
    }
}

/// Builder for [`WorkflowEngine`]
///
/// Everything not supplied falls back to an in-memory implementation.
pub struct WorkflowEngineBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    queues: Option<EngineQueues>,
    handlers: HandlerRegistry,
    subjects: Option<Arc<dyn SubjectSource>>,
    scheduler: Option<Arc<dyn DelayScheduler>>,
    clock: SharedClock,
    config: EngineConfig,
    pool: WorkerPoolConfig,
}

impl Default for WorkflowEngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            queues: None,
            handlers: HandlerRegistry::new(),
            subjects: None,
            scheduler: None,
            clock: system_clock(),
            config: EngineConfig::default(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

impl WorkflowEngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queues(mut self, queues: EngineQueues) -> Self {
        self.queues = Some(queues);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register one action handler
    pub fn with_handler(mut self, name: impl Into<String>, handler: impl StepHandler) -> Self {
        self.handlers.register(name, handler);
        self
    }

    pub fn with_subjects(mut self, subjects: Arc<dyn SubjectSource>) -> Self {
        self.subjects = Some(subjects);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn DelayScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Worker identity and concurrency shared by the four queue consumers
    pub fn with_pool_config(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let clock = self.clock;
        let config = self.config;
        let metrics = Arc::new(EngineMetrics::new());

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new()));
        let queues = self
            .queues
            .unwrap_or_else(|| EngineQueues::in_memory(clock.clone(), config.queue_max_receives));
        let subjects = self
            .subjects
            .unwrap_or_else(|| Arc::new(InMemorySubjectSource::new()));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(QueueDelayScheduler::new(queues.steps.clone())));

        let triggers = Arc::new(
            TriggerProcessor::new(
                store.clone(),
                queues.steps.clone(),
                metrics.clone(),
                config.clone(),
            )
            .with_clock(clock.clone()),
        );
        let executor = Arc::new(
            StepExecutor::new(
                store.clone(),
                self.handlers,
                subjects.clone(),
                queues.steps.clone(),
                scheduler,
                metrics.clone(),
                config.clone(),
            )
            .with_clock(clock.clone()),
        );
        let failures = Arc::new(
            FailureProcessor::new(store.clone(), metrics.clone()).with_clock(clock.clone()),
        );
        let cleanup = Arc::new(
            RetentionCleanupJob::new(store.clone(), metrics.clone(), config.clone())
                .with_clock(clock.clone()),
        );
        let scheduled = Arc::new(
            ScheduledTriggerPoller::new(store.clone(), subjects, triggers.clone())
                .with_clock(clock.clone()),
        );
        let sweeper = Arc::new(
            StalledExecutionSweeper::new(store.clone(), queues.steps.clone(), config.clone())
                .with_clock(clock.clone()),
        );

        let poller = self
            .pool
            .poller
            .clone()
            .with_visibility_timeout(config.visibility_timeout);
        let pool_config = |suffix: &str, poller: PollerConfig| {
            self.pool
                .clone()
                .with_worker_id(format!("{}-{suffix}", self.pool.worker_id))
                .with_poller(poller)
        };

        let trigger_pool = WorkerPool::<TriggerMessage>::new(
            queues.triggers.clone(),
            triggers.clone(),
            pool_config(
                "triggers",
                poller
                    .clone()
                    .with_batch_size(config.trigger_batch_size)
                    .with_batch_window(config.trigger_batch_window),
            ),
        );
        let step_pool = WorkerPool::<StepMessage>::new(
            queues.steps.clone(),
            executor.clone(),
            pool_config("steps", poller.clone()),
        );
        let trigger_dlq_pool = WorkerPool::<DeadLetter<TriggerMessage>>::new(
            queues.trigger_dlq.clone(),
            failures.clone(),
            pool_config("triggers-dlq", poller.clone()),
        );
        let step_dlq_pool = WorkerPool::<DeadLetter<StepMessage>>::new(
            queues.step_dlq.clone(),
            failures.clone(),
            pool_config("steps-dlq", poller),
        );

        let (shutdown_tx, _) = watch::channel(false);

        WorkflowEngine {
            store,
            queues,
            metrics,
            config,
            triggers,
            executor,
            failures,
            cleanup,
            scheduled,
            sweeper,
            trigger_pool,
            step_pool,
            trigger_dlq_pool,
            step_dlq_pool,
            shutdown_tx,
            periodic: Mutex::new(Vec::new()),
        }
    }
}

/// A fully wired engine
///
/// Drive it inline with [`run_until_idle`](Self::run_until_idle), or run
/// the queue consumers and periodic jobs in the background with
/// [`start`](Self::start) / [`shutdown`](Self::shutdown).
pub struct WorkflowEngine {
    store: Arc<dyn ExecutionStore>,
    queues: EngineQueues,
    metrics: Arc<EngineMetrics>,
    config: EngineConfig,
    triggers: Arc<TriggerProcessor>,
    executor: Arc<StepExecutor>,
    failures: Arc<FailureProcessor>,
    cleanup: Arc<RetentionCleanupJob>,
    scheduled: Arc<ScheduledTriggerPoller>,
    sweeper: Arc<StalledExecutionSweeper>,
    trigger_pool: WorkerPool<TriggerMessage>,
    step_pool: WorkerPool<StepMessage>,
    trigger_dlq_pool: WorkerPool<DeadLetter<TriggerMessage>>,
    step_dlq_pool: WorkerPool<DeadLetter<StepMessage>>,
    shutdown_tx: watch::Sender<bool>,
    periodic: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn queues(&self) -> &EngineQueues {
        &self.queues
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn triggers(&self) -> &Arc<TriggerProcessor> {
        &self.triggers
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    pub fn failures(&self) -> &Arc<FailureProcessor> {
        &self.failures
    }

    pub fn cleanup(&self) -> &Arc<RetentionCleanupJob> {
        &self.cleanup
    }

    pub fn scheduled_poller(&self) -> &Arc<ScheduledTriggerPoller> {
        &self.scheduled
    }

    pub fn sweeper(&self) -> &Arc<StalledExecutionSweeper> {
        &self.sweeper
    }

    /// Store a definition (a new version if the id exists)
    pub async fn define(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, EngineError> {
        Ok(self.store.put_definition(definition).await?)
    }

    /// Put a domain event on the trigger queue
    pub async fn publish(&self, event: &TriggerMessage) -> Result<Uuid, EngineError> {
        Ok(self.queues.triggers.send(event).await?)
    }

    /// Cancel an execution; `false` if it already finished
    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> Result<bool, EngineError> {
        self.executor.cancel(execution_id, reason).await
    }

    /// Handle visible messages on all four queues until none are left
    ///
    /// Delayed messages (retries, wake-ups) stay queued until the clock
    /// reaches them. Stops after `max_rounds` rounds; returns the number of
    /// messages handled.
    pub async fn run_until_idle(&self, max_rounds: usize) -> Result<usize, WorkerPoolError> {
        let mut handled = 0;
        for _ in 0..max_rounds {
            let round = self.trigger_pool.process_once().await?
                + self.step_pool.process_once().await?
                + self.step_dlq_pool.process_once().await?
                + self.trigger_dlq_pool.process_once().await?;
            if round == 0 {
                break;
            }
            handled += round;
        }
        Ok(handled)
    }

    /// Start the queue consumers and periodic jobs
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        self.trigger_pool.start()?;
        self.step_pool.start()?;
        self.trigger_dlq_pool.start()?;
        self.step_dlq_pool.start()?;

        let sweep_interval = (self.config.stalled_threshold / 2).max(Duration::from_secs(1));
        let jobs = [
            (self.cleanup.clone() as Arc<dyn PeriodicJob>, CLEANUP_CHECK_INTERVAL),
            (self.scheduled.clone() as Arc<dyn PeriodicJob>, self.config.poller_interval),
            (self.sweeper.clone() as Arc<dyn PeriodicJob>, sweep_interval),
        ];

        let mut periodic = self.periodic.lock();
        for (job, interval) in jobs {
            info!(job = job.name(), ?interval, "starting periodic job");
            periodic.push(PeriodicTask::new(job, interval).spawn(self.shutdown_tx.subscribe()));
        }
        Ok(())
    }

    /// Stop consuming and wait for in-flight work
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        let _ = self.shutdown_tx.send(true);

        let (triggers, steps, trigger_dlq, step_dlq) = tokio::join!(
            self.trigger_pool.shutdown(),
            self.step_pool.shutdown(),
            self.trigger_dlq_pool.shutdown(),
            self.step_dlq_pool.shutdown(),
        );

        let handles: Vec<_> = self.periodic.lock().drain(..).collect();
        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle {
                error!(error = %e, "periodic job panicked");
            }
        }

        triggers.and(steps).and(trigger_dlq).and(step_dlq)
    }
}
