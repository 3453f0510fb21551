//! Worker pool for queue consumption
//!
//! Manages concurrent message handling with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, PollerError, QueuePoller};
use crate::duration_serde::millis;
use crate::queue::{Delivery, MessageQueue, NackOutcome, QueueError, QueueMessage};

/// How a handled message is settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; delete it
    Ack,

    /// Deliver again after `delay` (dead-lettered once the receive budget is spent)
    Retry { error: String, delay: Duration },

    /// Give up now and move it to the dead-letter queue
    DeadLetter { reason: String },
}

/// Consumer of one queue's messages
#[async_trait]
pub trait MessageHandler<M: QueueMessage>: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery<M>) -> Disposition;
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum messages handled concurrently
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Running and receiving messages
    Running,
    /// Finishing in-flight messages, not receiving new ones
    Draining,
    /// Stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool consuming one queue
///
/// # Example
///
/// ```ignore
/// use tenantflow_engine::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(step_queue, executor, WorkerPoolConfig::new().with_max_concurrency(20));
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<M: QueueMessage> {
    queue: Arc<dyn MessageQueue<M>>,
    handler: Arc<dyn MessageHandler<M>>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<M: QueueMessage> WorkerPool<M> {
    pub fn new(
        queue: Arc<dyn MessageQueue<M>>,
        handler: Arc<dyn MessageHandler<M>>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            queue,
            handler,
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active,
            poll_handle: Mutex::new(None),
        }
    }

    /// Start the polling loop
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, queue = %self.queue.name()))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            queue = %self.queue.name(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        self.start_poll_loop();
        Ok(())
    }

    /// Stop receiving and wait for in-flight messages
    ///
    /// Messages still in flight after the timeout become visible again
    /// once their visibility timeout lapses.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, queue = %self.queue.name()))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if self.status() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Poll loop panicked");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active.available_permits();
            if available == self.config.max_concurrency {
                debug!("All messages settled");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Messages currently being handled
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.active.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Receive and handle one batch inline
    ///
    /// Returns the number of messages handled. Used to drive the engine
    /// deterministically without background tasks.
    pub async fn process_once(&self) -> Result<usize, WorkerPoolError> {
        let batch = self
            .queue
            .receive(
                self.config.poller.batch_size,
                self.config.poller.visibility_timeout,
            )
            .await?;

        let count = batch.len();
        for delivery in batch {
            let disposition = self.handler.handle(&delivery).await;
            settle(self.queue.as_ref(), &delivery, disposition).await;
        }
        Ok(count)
    }

    fn start_poll_loop(&self) {
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let active = Arc::clone(&self.active);
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller =
                QueuePoller::new(Arc::clone(&queue), config.poller.clone(), shutdown_rx);

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available = active.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(batch) => {
                        for delivery in batch {
                            // Unclaimed deliveries reappear after their visibility timeout
                            let permit = match Arc::clone(&active).try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    debug!("No permits available");
                                    break;
                                }
                            };

                            let queue = Arc::clone(&queue);
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                let disposition = handler.handle(&delivery).await;
                                settle(queue.as_ref(), &delivery, disposition).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Poll error");
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

/// Apply a handler's disposition to the delivery
async fn settle<M: QueueMessage>(
    queue: &dyn MessageQueue<M>,
    delivery: &Delivery<M>,
    disposition: Disposition,
) {
    let result = match disposition {
        Disposition::Ack => queue.ack(delivery.id).await,
        Disposition::Retry { error, delay } => {
            queue
                .nack(delivery, &error, delay)
                .await
                .map(|outcome| {
                    if outcome == NackOutcome::DeadLettered {
                        warn!(
                            queue = %queue.name(),
                            message_id = %delivery.id,
                            receive_count = delivery.receive_count,
                            %error,
                            "message dead-lettered after repeated failures"
                        );
                    }
                })
        }
        Disposition::DeadLetter { reason } => queue.dead_letter(delivery, &reason).await,
    };

    if let Err(e) = result {
        // The delivery reappears after its visibility timeout
        error!(
            queue = %queue.name(),
            message_id = %delivery.id,
            error = %e,
            "failed to settle message"
        );
    }
}
